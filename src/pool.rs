use core::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::Ordering::*,
};

use crate::{
    backend::Backend,
    bits,
    heap::Heap,
    pal::Pal,
    sync::{AbaStack, FlagLock, FlagLockGuard},
};

/// The list of every heap ever created, newest first.
struct AllHeaps<'g, P: Pal> {
    head: Option<&'g Heap<'g, P>>,
    len: usize,
}

/// The heaps of one [`Globals`](crate::globals::Globals).
///
/// Heaps are created in metadata memory and never destroyed: a thread that
/// exits hands its heap back, and the next thread to arrive takes it over
/// along with whatever slabs it still holds.
pub struct Pool<'g, P: Pal> {
    free: AbaStack<Heap<'g, P>>,
    all: FlagLock<AllHeaps<'g, P>>,
}

impl<P: Pal> fmt::Debug for Pool<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("len", &self.len()).finish_non_exhaustive()
    }
}

impl<P: Pal> Default for Pool<'_, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'g, P: Pal> Pool<'g, P> {
    pub const fn new() -> Self {
        Pool {
            free: AbaStack::new(),
            all: FlagLock::new(AllHeaps { head: None, len: 0 }),
        }
    }

    /// Takes a free heap, or creates one over `backend` if there is none.
    ///
    /// Returns `None` when no metadata memory is left for a new heap.
    pub fn acquire(&self, backend: &'g Backend<P>) -> Option<&'g Heap<'g, P>> {
        if let Some(heap) = self.free.pop() {
            // SAFETY: pooled heaps are never freed.
            let heap = unsafe { heap.as_ref() };
            heap.in_use().store(true, Relaxed);
            return Some(heap);
        }

        let size = bits::next_pow2(size_of::<Heap<'g, P>>());
        let ptr = backend.alloc_meta_data(None, size)?.cast::<Heap<'g, P>>();
        // SAFETY: the block is fresh, large and aligned enough, and never
        // returned to the backend.
        let heap = unsafe {
            ptr.write(Heap::new(backend));
            ptr.as_ref()
        };
        heap.init();
        heap.in_use().store(true, Relaxed);

        let mut all = self.all.lock();
        heap.all_next().store(all.head.map_or(ptr::null_mut(), |h| ptr::from_ref(h).cast_mut()), Relaxed);
        all.head = Some(heap);
        all.len += 1;
        drop(all);

        backend.stats().add_heap();
        log_at!(debug, "pool: created heap {:#x}", heap.id());
        Some(heap)
    }

    /// Puts a heap back for reuse.
    ///
    /// # Safety
    ///
    /// `heap` must come from [`acquire`](Self::acquire) of this pool and must
    /// not be used by the caller afterwards.
    pub unsafe fn release(&self, heap: &'g Heap<'g, P>) {
        debug_assert!(heap.in_use().load(Relaxed));
        heap.in_use().store(false, Relaxed);
        // SAFETY: heaps live forever and are in no other stack.
        unsafe { self.free.push(NonNull::from(heap)) }
    }

    /// Every heap ever created, in use or not.
    ///
    /// The pool cannot create heaps while the iterator is alive, so it must
    /// not be held across [`acquire`](Self::acquire).
    pub fn heaps(&self) -> Heaps<'_, 'g, P> {
        let all = self.all.lock();
        let next = all.head;
        Heaps { _all: all, next }
    }

    /// The number of heaps ever created.
    pub fn len(&self) -> usize {
        self.all.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An iterator over the heaps of a [`Pool`], holding its list lock.
pub struct Heaps<'a, 'g, P: Pal> {
    _all: FlagLockGuard<'a, AllHeaps<'g, P>>,
    next: Option<&'g Heap<'g, P>>,
}

impl<'g, P: Pal> Iterator for Heaps<'_, 'g, P> {
    type Item = &'g Heap<'g, P>;

    fn next(&mut self) -> Option<Self::Item> {
        let heap = self.next?;
        // SAFETY: heaps are never freed, and `all_next` is only written
        // under the lock before a heap is linked.
        self.next = unsafe { heap.all_next().load(Relaxed).as_ref() };
        Some(heap)
    }
}

#[cfg(all(test, feature = "libc"))]
mod tests {
    use std::{boxed::Box, thread, vec::Vec};

    use super::*;
    use crate::{config::Mitigations, pal::UnixPal};

    fn setup() -> (&'static Backend<UnixPal>, &'static Pool<'static, UnixPal>) {
        let backend = Box::leak(Box::new(Backend::new(UnixPal::new(false), Mitigations::NONE)));
        backend.init().unwrap();
        (backend, Box::leak(Box::new(Pool::new())))
    }

    #[test]
    fn released_heaps_are_reused() {
        let (backend, pool) = setup();
        let a = pool.acquire(backend).unwrap();
        let b = pool.acquire(backend).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id() % (1 << Heap::<UnixPal>::ID_SHIFT), 0);
        assert_eq!(pool.len(), 2);

        unsafe { pool.release(a) };
        let c = pool.acquire(backend).unwrap();
        assert_eq!(c.id(), a.id());
        assert_eq!(pool.len(), 2);
        let ids: Vec<usize> = pool.heaps().map(|h| h.id()).collect();
        assert_eq!(ids, [b.id(), a.id()]);
        assert_eq!(backend.stats().snapshot().heaps, 2);
    }

    #[test]
    fn concurrent_acquire() {
        let (backend, pool) = setup();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(move || {
                    let heap = pool.acquire(backend).unwrap();
                    let ptr = heap.alloc(100).unwrap();
                    unsafe { heap.dealloc(ptr.as_ptr()) };
                    // Walking the list while others link new heaps.
                    assert!(pool.heaps().any(|h| h.id() == heap.id()));
                    let id = heap.id();
                    unsafe { pool.release(heap) };
                    id
                })
            })
            .collect();
        let ids: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(pool.len() <= 8);
        assert_eq!(pool.heaps().count(), pool.len());
        let all: Vec<usize> = pool.heaps().map(|h| h.id()).collect();
        assert!(ids.iter().all(|id| all.contains(id)));
        assert!(pool.heaps().all(|h| !h.in_use().load(Relaxed)));
    }
}
