use core::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering::*},
};

use crate::{
    aal::CACHELINE_SIZE,
    entropy::FreeListKey,
    error::Corruption,
    ptr::CapPtr,
    sizeclass::REMOTE_MIN_ALIGN,
    slab::{FreeObject, FreePtr, freelist::NO_KEY_TWEAK},
};

#[repr(C, align(64))]
struct Consumer {
    front: AtomicUsize,
    stub: FreeObject,
}

/// The message queue of one heap: an intrusive multi-producer,
/// single-consumer queue of free objects.
///
/// Producers only ever swap the back pointer and then publish the link from
/// their predecessor, so an enqueue is wait-free. The queue always holds at
/// least one node: a stub object inside the queue stands in when every
/// message has been taken out.
///
/// The address of the queue is the identity of its heap, stored in the
/// pagemap entry of every chunk the heap owns.
#[repr(C, align(256))]
pub struct RemoteAllocator {
    back: AtomicUsize,
    consumer: Consumer,
}

const _: () = assert!(align_of::<RemoteAllocator>() >= REMOTE_MIN_ALIGN);
const _: () = assert!(align_of::<Consumer>() >= CACHELINE_SIZE);

impl fmt::Debug for RemoteAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAllocator")
            .field("id", &format_args!("{:#x}", self.id()))
            .field("back", &format_args!("{:#x}", self.back.load(Relaxed)))
            .field("front", &format_args!("{:#x}", self.consumer.front.load(Relaxed)))
            .finish()
    }
}

impl Default for RemoteAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteAllocator {
    /// Creates an unusable queue; it must be [`init`](Self::init)ialized in
    /// its final place.
    pub const fn new() -> Self {
        RemoteAllocator {
            back: AtomicUsize::new(0),
            consumer: Consumer { front: AtomicUsize::new(0), stub: FreeObject::new() },
        }
    }

    /// Points both ends at the stub. The queue must not move afterwards.
    pub fn init(&self, key: &FreeListKey) {
        let stub = self.stub();
        FreeObject::atomic_store_null(stub, key, NO_KEY_TWEAK);
        let addr = stub.as_ptr().expose_provenance();
        self.consumer.front.store(addr, Relaxed);
        self.back.store(addr, Release);
    }

    /// The identity of the owning heap.
    #[inline]
    pub fn id(&self) -> usize {
        ptr::from_ref(self).expose_provenance()
    }

    /// Recovers a queue from the identity found in a pagemap entry.
    ///
    /// # Safety
    ///
    /// `id` must come from [`id`](Self::id) of a queue alive for `'a`.
    #[inline]
    pub unsafe fn from_id<'a>(id: usize) -> &'a Self {
        // SAFETY: see the contract.
        unsafe { &*ptr::with_exposed_provenance::<Self>(id) }
    }

    fn stub(&self) -> FreePtr {
        // SAFETY: the stub is a free object owned by this queue.
        unsafe { CapPtr::new_tame(NonNull::from(&self.consumer.stub)) }
    }

    /// Appends the chain `first ..= last`, already linked with `key`.
    ///
    /// May be called from any thread.
    pub fn enqueue(&self, first: FreePtr, last: FreePtr, key: &FreeListKey) {
        FreeObject::atomic_store_null(last, key, NO_KEY_TWEAK);
        let prev = self.back.swap(last.as_ptr().expose_provenance(), AcqRel);
        let prev = ptr::with_exposed_provenance_mut::<FreeObject>(prev);
        // SAFETY: `back` always points to a node of this queue, which stays
        // allocated at least until the consumer has followed its link.
        let prev = unsafe { CapPtr::new_tame(NonNull::new_unchecked(prev)) };
        FreeObject::atomic_store_next(prev, Some(first), key, NO_KEY_TWEAK);
    }

    /// Whether a message might be waiting. Only meaningful to the consumer.
    #[inline]
    pub fn can_dequeue(&self) -> bool {
        let stub = ptr::from_ref(&self.consumer.stub).addr();
        self.consumer.front.load(Relaxed) != stub || self.back.load(Relaxed) != stub
    }

    fn read_next(
        &self,
        node: FreePtr,
        key: &FreeListKey,
        domesticate: &mut impl FnMut(usize) -> bool,
    ) -> Result<Option<FreePtr>, Corruption> {
        // SAFETY: `node` is a tame node of this queue.
        let obj = unsafe { node.as_non_null().as_ref() };
        let Some(wild) = obj.atomic_read_next(key, NO_KEY_TWEAK) else { return Ok(None) };
        let stub = self.stub().addr();
        let addr = wild.addr();
        wild.domesticate(|a| a == stub || domesticate(a))
            .map(Some)
            .ok_or(Corruption::BadMessage { addr })
    }

    fn node(addr: usize) -> FreePtr {
        // SAFETY: only addresses of domesticated nodes are stored in `front`.
        unsafe { CapPtr::new_tame(NonNull::new_unchecked(ptr::with_exposed_provenance_mut(addr))) }
    }

    fn pop(
        &self,
        key: &FreeListKey,
        domesticate: &mut impl FnMut(usize) -> bool,
    ) -> Result<Option<FreePtr>, Corruption> {
        let stub = self.stub();
        let front = &self.consumer.front;
        let mut curr = Self::node(front.load(Relaxed));
        let mut next = self.read_next(curr, key, domesticate)?;

        if curr == stub {
            let Some(n) = next else { return Ok(None) };
            front.store(n.as_ptr().expose_provenance(), Relaxed);
            curr = n;
            next = self.read_next(curr, key, domesticate)?;
        }
        if let Some(n) = next {
            front.store(n.as_ptr().expose_provenance(), Relaxed);
            return Ok(Some(curr));
        }
        if curr.addr() != self.back.load(Acquire) {
            // A producer has swapped the back but not linked it yet.
            return Ok(None);
        }
        self.enqueue(stub, stub, key);
        match self.read_next(curr, key, domesticate)? {
            Some(n) => {
                front.store(n.as_ptr().expose_provenance(), Relaxed);
                Ok(Some(curr))
            }
            None => Ok(None),
        }
    }

    /// Takes messages in FIFO order, passing each to `f` until it returns
    /// `false` or the queue runs dry.
    ///
    /// Every link read from the queue must pass `domesticate`.
    ///
    /// Must only be called by the owning heap.
    pub fn dequeue(
        &self,
        key: &FreeListKey,
        mut domesticate: impl FnMut(usize) -> bool,
        mut f: impl FnMut(FreePtr) -> bool,
    ) -> Result<(), Corruption> {
        while let Some(msg) = self.pop(key, &mut domesticate)? {
            if !f(msg) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{boxed::Box, sync::Arc, thread, vec, vec::Vec};

    use super::*;
    use crate::config::Mitigations;

    struct Nodes(Vec<[usize; 2]>);

    impl Nodes {
        fn new(n: usize) -> Self {
            Nodes(vec![[0; 2]; n])
        }

        fn get(&mut self, i: usize) -> FreePtr {
            unsafe { FreeObject::make(NonNull::from(&mut self.0[i]).cast()) }
        }
    }

    fn key() -> FreeListKey {
        FreeListKey::fixed(Mitigations::HARDENED).for_queues()
    }

    #[test]
    fn fifo_in_one_thread() {
        let key = key();
        let queue = Box::new(RemoteAllocator::new());
        queue.init(&key);
        assert!(!queue.can_dequeue());

        let mut nodes = Nodes::new(5);
        let ptrs: Vec<_> = (0..5).map(|i| nodes.get(i)).collect();
        queue.enqueue(ptrs[0], ptrs[0], &key);
        // A pre-linked chain goes in as one.
        FreeObject::link(ptrs[1], ptrs[2], &key, NO_KEY_TWEAK);
        queue.enqueue(ptrs[1], ptrs[2], &key);
        assert!(queue.can_dequeue());

        let mut out = Vec::new();
        queue.dequeue(&key, |_| true, |m| {
            out.push(m);
            true
        })
        .unwrap();
        assert_eq!(out, ptrs[..3]);
        assert!(!queue.can_dequeue());

        // The queue keeps working after the stub went around.
        queue.enqueue(ptrs[3], ptrs[3], &key);
        queue.enqueue(ptrs[4], ptrs[4], &key);
        out.clear();
        queue.dequeue(&key, |_| true, |m| {
            out.push(m);
            false
        })
        .unwrap();
        assert_eq!(out, [ptrs[3]]);
        queue.dequeue(&key, |_| true, |m| {
            out.push(m);
            true
        })
        .unwrap();
        assert_eq!(out, ptrs[3..]);
    }

    #[test]
    fn rejects_foreign_links() {
        let key = key();
        let queue = Box::new(RemoteAllocator::new());
        queue.init(&key);
        let mut nodes = Nodes::new(2);
        let (a, b) = (nodes.get(0), nodes.get(1));
        queue.enqueue(a, a, &key);
        queue.enqueue(b, b, &key);
        let err = queue.dequeue(&key, |addr| addr != b.addr(), |_| true).unwrap_err();
        assert_eq!(err, Corruption::BadMessage { addr: b.addr() });
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn fifo_per_producer() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2000;

        let key = key();
        let queue = Arc::new(RemoteAllocator::new());
        queue.init(&key);
        // Each node carries its producer and sequence number in its second
        // word, which the queue leaves alone.
        let nodes: &'static mut [[usize; 2]] =
            Box::leak(vec![[0; 2]; PRODUCERS * PER_PRODUCER].into_boxed_slice());
        let base = nodes.as_mut_ptr().expose_provenance();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        let addr = base + (p * PER_PRODUCER + seq) * 16;
                        let node = ptr::with_exposed_provenance_mut::<u8>(addr);
                        let node = unsafe { FreeObject::make(NonNull::new(node).unwrap()) };
                        unsafe { node.as_non_null().as_ref() }.set_aux(p << 32 | seq);
                        queue.enqueue(node, node, &key);
                    }
                })
            })
            .collect();

        let mut next_seq = [0; PRODUCERS];
        let mut received = 0;
        while received < PRODUCERS * PER_PRODUCER {
            queue
                .dequeue(&key, |_| true, |m| {
                    let word = unsafe { m.as_non_null().as_ref() }.aux();
                    let (p, seq) = (word >> 32, word & 0xffff_ffff);
                    assert_eq!(seq, next_seq[p]);
                    next_seq[p] += 1;
                    received += 1;
                    true
                })
                .unwrap();
            std::hint::spin_loop();
        }
        producers.into_iter().for_each(|t| t.join().unwrap());
        assert_eq!(next_seq, [PER_PRODUCER; PRODUCERS]);
    }
}
