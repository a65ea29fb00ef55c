use core::fmt;

use array_macro::array;

use super::{RemoteAllocator, close_ring};
use crate::{
    backend::MetaEntry,
    bits,
    config::{REMOTE_CACHE, REMOTE_RING_BYTES, REMOTE_RING_SLOTS, REMOTE_SLOT_BITS},
    entropy::{FreeListKey, LocalEntropy},
    error::Corruption,
    sizeclass::{self, SizeClass},
    slab::{Builder, FreeObject, FreePtr, SlabMetadata, freelist::NO_KEY_TWEAK},
};

const SLOTS: usize = 1 << REMOTE_SLOT_BITS;
const SLOT_MASK: usize = SLOTS - 1;
const WAYS: usize = bits::min(2, REMOTE_RING_SLOTS);
const SETS: usize = REMOTE_RING_SLOTS / WAYS;

/// The ring being collected for one destination slab.
struct Ring {
    /// The address of the slab's metadata, or zero if the ring is free.
    meta: usize,
    remote: usize,
    sc: SizeClass,
    objects: Builder,
}

impl Ring {
    fn new() -> Self {
        Ring { meta: 0, remote: 0, sc: SizeClass::UNOWNED, objects: Builder::new() }
    }
}

/// The outbound side of remote deallocation.
///
/// Frees of foreign objects are first collected into rings, one per
/// destination slab, in a small set-associative table. A ring is sealed into
/// a message once it is large enough or evicted by another slab; sealed
/// messages wait in slots indexed by bits of their destination's identity
/// until [`post`](Self::post) sends every slot in one enqueue.
///
/// `capacity` bounds the bytes held between posts.
pub struct RemoteDeallocCache {
    slots: [Option<(FreePtr, FreePtr)>; SLOTS],
    rings: [Ring; REMOTE_RING_SLOTS],
    capacity: usize,
    id_shift: usize,
}

impl fmt::Debug for RemoteDeallocCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDeallocCache")
            .field("capacity", &self.capacity)
            .field("pending_slots", &self.slots.iter().filter(|s| s.is_some()).count())
            .field("open_rings", &self.rings.iter().filter(|r| r.meta != 0).count())
            .finish()
    }
}

/// The slot of destination `id` in round `round`.
///
/// Each round looks at the next `REMOTE_SLOT_BITS` bits of the identity,
/// skipping the `id_shift` low bits that every identity shares.
#[inline]
fn slot_of(id: usize, id_shift: usize, round: usize) -> Option<usize> {
    let shift = id_shift + round * REMOTE_SLOT_BITS;
    (shift < bits::BITS).then(|| (id >> shift) & SLOT_MASK)
}

impl RemoteDeallocCache {
    /// `id_shift` is the log2 of the alignment of every heap identity.
    pub fn new(id_shift: usize) -> Self {
        RemoteDeallocCache {
            slots: [None; SLOTS],
            rings: array![_ => Ring::new(); REMOTE_RING_SLOTS],
            capacity: REMOTE_CACHE,
            id_shift,
        }
    }

    /// Claims room for `n` objects of the slab behind `entry`, returning
    /// `false` once the cache should be posted instead.
    #[inline]
    pub fn reserve_space(&mut self, entry: &MetaEntry, n: u16) -> bool {
        let size = n as usize * sizeclass::sizeclass_full_to_size(entry.sizeclass());
        if self.capacity > size {
            self.capacity -= size;
            true
        } else {
            false
        }
    }

    fn push_slot(&mut self, slot: usize, msg: FreePtr, qkey: &FreeListKey) {
        debug_assert!(!qkey.backward);
        self.slots[slot] = Some(match self.slots[slot] {
            Some((head, tail)) => {
                FreeObject::link(tail, msg, qkey, NO_KEY_TWEAK);
                (head, msg)
            }
            None => (msg, msg),
        });
    }

    fn seal(&mut self, index: usize, key: &FreeListKey, qkey: &FreeListKey) {
        let ring = &mut self.rings[index];
        let meta = core::mem::replace(&mut ring.meta, 0);
        let tweak = SlabMetadata::key_tweak_at(meta);
        let Some((first, last, len)) = ring.objects.extract_segment(key, tweak) else { return };
        close_ring(first, last, len, ring.sc, key, tweak);
        let remote = ring.remote;
        let slot = slot_of(remote, self.id_shift, 0).unwrap_or(0);
        self.push_slot(slot, last, qkey);
    }

    /// Takes a foreign object for the heap recorded in `entry`.
    ///
    /// The caller must have [`reserve`](Self::reserve_space)d room for it.
    pub fn dealloc(
        &mut self,
        entry: &MetaEntry,
        obj: FreePtr,
        key: &FreeListKey,
        qkey: &FreeListKey,
        entropy: &mut LocalEntropy,
    ) {
        let meta = entry.meta_addr();
        let tweak = entry.key_tweak();
        let set = (tweak.wrapping_mul(0x7EFB_352D) >> 16) % SETS;
        let ways = set * WAYS..(set + 1) * WAYS;

        let index = match self.rings[ways.clone()].iter().position(|r| r.meta == meta) {
            Some(way) => set * WAYS + way,
            None => {
                let index = match self.rings[ways.clone()].iter().position(|r| r.meta == 0) {
                    Some(way) => set * WAYS + way,
                    None => {
                        let victim = ways
                            .max_by_key(|&i| self.rings[i].objects.len())
                            .unwrap_or(set * WAYS);
                        self.seal(victim, key, qkey);
                        victim
                    }
                };
                let ring = &mut self.rings[index];
                ring.meta = meta;
                ring.remote = entry.remote();
                ring.sc = entry.sizeclass();
                ring.objects.init(false);
                index
            }
        };

        let ring = &mut self.rings[index];
        ring.objects.add(obj, key, tweak, entropy);
        if ring.objects.len() * sizeclass::sizeclass_full_to_size(ring.sc) >= REMOTE_RING_BYTES {
            self.seal(index, key, qkey);
        }
    }

    /// Re-routes a sealed message that reached the wrong heap.
    ///
    /// The caller must have reserved room for its objects.
    pub fn forward(&mut self, target: usize, msg: FreePtr, qkey: &FreeListKey) {
        let slot = slot_of(target, self.id_shift, 0).unwrap_or(0);
        self.push_slot(slot, msg, qkey);
    }

    /// Sends everything held, returning whether any message left.
    ///
    /// Each slot goes as one chain to the owner of its first message, which
    /// forwards whatever is not its own. The slot matching this heap's own
    /// identity cannot be sent that way, so its messages are redistributed by
    /// the next bits of their destinations and the process repeats.
    pub fn post(
        &mut self,
        own_id: usize,
        key: &FreeListKey,
        qkey: &FreeListKey,
        get_entry: impl Fn(usize) -> MetaEntry,
    ) -> Result<bool, Corruption> {
        for index in 0..REMOTE_RING_SLOTS {
            if self.rings[index].meta != 0 {
                self.seal(index, key, qkey);
            }
        }

        let mut sent = false;
        let mut round = 0;
        loop {
            let own_slot = slot_of(own_id, self.id_shift, round);
            for slot in 0..SLOTS {
                if Some(slot) == own_slot {
                    continue;
                }
                let Some((first, last)) = self.slots[slot].take() else { continue };
                let entry = get_entry(first.addr());
                if entry.is_backend_owned() {
                    return Err(Corruption::BackendOwned { addr: first.addr() });
                }
                // SAFETY: heaps live as long as the process, and the entry
                // names the heap owning `first`.
                unsafe { RemoteAllocator::from_id(entry.remote()) }.enqueue(first, last, qkey);
                sent = true;
            }

            let Some(own_slot) = own_slot else { break };
            let Some((first, last)) = self.slots[own_slot].take() else { break };
            round += 1;

            let mut curr = Some(first);
            while let Some(msg) = curr {
                curr = if msg == last {
                    None
                } else {
                    // SAFETY: `msg` was linked by `push_slot`.
                    let next = unsafe { msg.as_non_null().as_ref() }.read_next(qkey, NO_KEY_TWEAK);
                    let next = next.ok_or(Corruption::BadMessage { addr: msg.addr() })?;
                    let addr = next.addr();
                    Some(next.domesticate(|a| !get_entry(a).is_unowned()).ok_or(Corruption::BadMessage { addr })?)
                };
                let target = get_entry(msg.addr()).remote();
                let slot = slot_of(target, self.id_shift, round).unwrap_or(0);
                self.push_slot(slot, msg, qkey);
            }
        }

        self.capacity = REMOTE_CACHE;
        Ok(sent)
    }

    /// Whether nothing is waiting to be posted.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none) && self.rings.iter().all(|r| r.meta == 0)
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;
    use std::{boxed::Box, collections::BTreeSet, vec, vec::Vec};

    use super::*;
    use crate::{config::Mitigations, ptr::CapPtr, remote::open_ring};

    const SC: usize = 4;

    struct Slab {
        _memory: Vec<u8>,
        ptr: *mut u8,
        meta: &'static SlabMetadata<'static>,
    }

    impl Slab {
        fn new(m: Mitigations) -> Self {
            let size = sizeclass::sizeclass_to_slab_size(SC);
            let mut memory = vec![0u8; size * 2];
            let offset = memory.as_ptr().addr().next_multiple_of(size) - memory.as_ptr().addr();
            let ptr = memory[offset..].as_mut_ptr();

            let words = SlabMetadata::alloc_size(0).div_ceil(size_of::<usize>());
            let mem: &'static mut [usize] = Box::leak(vec![0usize; words].into_boxed_slice());
            let meta = unsafe { SlabMetadata::new_in(NonNull::from(mem).cast(), 0) };
            meta.initialise(SC, ptr.addr(), m);
            Slab { _memory: memory, ptr, meta }
        }

        fn obj(&self, index: usize) -> FreePtr {
            let ptr = self.ptr.wrapping_add(index * sizeclass::sizeclass_to_size(SC));
            unsafe { FreeObject::make(NonNull::new(ptr).unwrap()) }
        }

        fn entry(&self, remote: &RemoteAllocator) -> MetaEntry {
            MetaEntry::new(Some(self.meta), remote.id(), SizeClass::from_small(SC))
        }

        fn contains(&self, addr: usize) -> bool {
            self.meta.contains(addr)
        }
    }

    /// A row of queues, so that tests can pick identities sharing slot bits.
    fn queues(n: usize, key: &FreeListKey) -> &'static [RemoteAllocator] {
        let queues: &'static [RemoteAllocator] =
            Box::leak((0..n).map(|_| RemoteAllocator::new()).collect::<Vec<_>>().into_boxed_slice());
        queues.iter().for_each(|q| q.init(key));
        queues
    }

    fn drain(
        queue: &RemoteAllocator,
        slab: &Slab,
        key: &FreeListKey,
        qkey: &FreeListKey,
    ) -> BTreeSet<usize> {
        let sc = SizeClass::from_small(SC);
        let tweak = slab.meta.as_key_tweak();
        let mut seen = BTreeSet::new();
        queue
            .dequeue(qkey, |a| slab.contains(a), |msg| {
                let (first, len) = open_ring(msg, sc, key, tweak, true).unwrap();
                let mut curr = first;
                for i in 0..len {
                    assert!(seen.insert(curr.addr()));
                    if i + 1 < len {
                        let next = unsafe { curr.as_non_null().as_ref() }.read_next(key, tweak).unwrap();
                        curr = unsafe { CapPtr::new_tame(next.as_non_null()) };
                    }
                }
                assert_eq!(curr, msg);
                true
            })
            .unwrap();
        seen
    }

    #[test]
    fn frees_reach_their_owner() {
        let m = Mitigations::FREELIST_FORWARD_EDGE.union(Mitigations::FREELIST_BACKWARD_EDGE);
        let key = FreeListKey::fixed(m);
        let qkey = key.for_queues();
        let queues = queues(2, &qkey);
        let (owner, me) = (&queues[0], &queues[1]);
        let slab = Slab::new(m);
        let entry = slab.entry(owner);

        let mut cache = RemoteDeallocCache::new(bits::next_pow2_bits(size_of::<RemoteAllocator>()));
        let mut entropy = LocalEntropy::with_seed(5, 5);
        let count = 3 * REMOTE_RING_BYTES / sizeclass::sizeclass_to_size(SC) + 7;
        let mut expected = BTreeSet::new();
        for i in 0..count {
            assert!(cache.reserve_space(&entry, 1));
            let obj = slab.obj(i);
            expected.insert(obj.addr());
            cache.dealloc(&entry, obj, &key, &qkey, &mut entropy);
        }
        assert!(!cache.is_empty());
        assert!(!owner.can_dequeue());

        let sent = cache.post(me.id(), &key, &qkey, |_| entry).unwrap();
        assert!(sent);
        assert!(cache.is_empty());
        assert_eq!(drain(owner, &slab, &key, &qkey), expected);
        assert!(!me.can_dequeue());
    }

    #[test]
    fn shared_slots_are_redistributed() {
        let key = FreeListKey::fixed(Mitigations::FREELIST_FORWARD_EDGE);
        let qkey = key.for_queues();
        // With one queue every 256 bytes and an 8-bit shift, queues `SLOTS`
        // apart share their first-round slot and differ in the second.
        let queues = queues(SLOTS + 1, &qkey);
        let (me, owner) = (&queues[0], &queues[SLOTS]);
        let mut cache = RemoteDeallocCache::new(8);
        assert_eq!(slot_of(me.id(), 8, 0), slot_of(owner.id(), 8, 0));
        assert_ne!(slot_of(me.id(), 8, 1), slot_of(owner.id(), 8, 1));

        let slab = Slab::new(Mitigations::FREELIST_FORWARD_EDGE);
        let entry = slab.entry(owner);
        let mut entropy = LocalEntropy::with_seed(1, 2);
        let objs: BTreeSet<usize> = (0..10)
            .map(|i| {
                let obj = slab.obj(i);
                cache.dealloc(&entry, obj, &key, &qkey, &mut entropy);
                obj.addr()
            })
            .collect();
        assert!(cache.post(me.id(), &key, &qkey, |_| entry).unwrap());
        assert_eq!(drain(owner, &slab, &key, &qkey), objs);
        assert!(!me.can_dequeue());
    }

    #[test]
    fn capacity_runs_out() {
        let key = FreeListKey::fixed(Mitigations::NONE);
        let qkey = key.for_queues();
        let queues = queues(1, &qkey);
        let slab = Slab::new(Mitigations::NONE);
        let entry = slab.entry(&queues[0]);
        let mut cache = RemoteDeallocCache::new(8);
        let size = sizeclass::sizeclass_to_size(SC);
        let n = (REMOTE_CACHE / size / 8).clamp(1, u16::MAX as usize) as u16;
        let mut reserved = 0;
        while cache.reserve_space(&entry, n) {
            reserved += n as usize * size;
        }
        assert!(reserved < REMOTE_CACHE);
        assert!(REMOTE_CACHE - reserved <= n as usize * size);
        // Posting, even with nothing to send, restores the capacity.
        assert!(!cache.post(0, &key, &qkey, |_| entry).unwrap());
        assert!(cache.reserve_space(&entry, 1));
    }
}
