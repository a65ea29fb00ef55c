//! The process-wide context of one allocator instance.

use core::{fmt, mem::ManuallyDrop, ops::Deref, sync::atomic::AtomicUsize};

use crate::{
    backend::Backend,
    config::Mitigations,
    entropy::FreeListKey,
    error::Error,
    heap::Heap,
    pal::Pal,
    pool::Pool,
    sizeclass,
    stat::Stat,
    sync::Singleton,
};

/// Everything the heaps of one allocator share: the backend with its
/// pagemap, the pool of heaps, and the free list keys.
///
/// Construction is `const` so that an instance can live in a static; the
/// pagemap and the keys are set up on first use.
pub struct Globals<'g, P: Pal> {
    backend: Backend<P>,
    pool: Pool<'g, P>,
    ready: Singleton<Result<(), Error>>,
}

impl<P: Pal + fmt::Debug> fmt::Debug for Globals<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Globals")
            .field("backend", &self.backend)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl<'g, P: Pal> Globals<'g, P> {
    pub const fn new(pal: P, mitigations: Mitigations) -> Self {
        Globals {
            backend: Backend::new(pal, mitigations),
            pool: Pool::new(),
            ready: Singleton::new(),
        }
    }

    pub fn backend(&self) -> &Backend<P> {
        &self.backend
    }

    pub fn pool(&self) -> &Pool<'g, P> {
        &self.pool
    }

    pub fn mitigations(&self) -> Mitigations {
        self.backend.mitigations()
    }

    fn init(&self) -> Result<(), Error> {
        *self.ready.get_or_init(|| {
            self.backend.init()?;
            let key = self.backend.key();
            log_at!(
                debug,
                "initialised with mitigations {} (forward: {}, backward: {})",
                self.mitigations(),
                key.forward,
                key.backward
            );
            Ok(())
        })
    }

    /// The key of the free lists, once the allocator is initialised.
    pub fn key(&self) -> Option<FreeListKey> {
        matches!(self.ready.get(), Some(Ok(()))).then(|| self.backend.key())
    }

    /// Takes a heap from the pool, initialising the allocator on first use.
    pub fn acquire(&'g self) -> Result<PooledHeap<'g, P>, Error> {
        self.init()?;
        let heap = self
            .pool
            .acquire(&self.backend)
            .ok_or(Error::OutOfMemory { size: size_of::<Heap<'g, P>>() })?;
        Ok(PooledHeap { heap, pool: &self.pool })
    }

    /// The size of the object at `ptr`, or 0 if the allocator does not own
    /// it.
    pub fn alloc_size(&self, ptr: *const u8) -> usize {
        let entry = self.backend.get_entry(ptr.addr());
        if entry.is_unowned() || entry.is_backend_owned() {
            return 0;
        }
        sizeclass::sizeclass_full_to_size(entry.sizeclass())
    }

    /// The bytes from `addr` to the end of its object.
    ///
    /// Addresses the allocator does not know are unbounded; addresses of the
    /// backend's own blocks have no room at all.
    pub fn remaining_bytes(&self, addr: usize) -> usize {
        let entry = self.backend.get_entry(addr);
        if entry.is_backend_owned() {
            return 0;
        }
        sizeclass::remaining_bytes(entry.sizeclass(), addr)
    }

    /// The start of the object containing `addr`, or `addr` itself if the
    /// allocator does not own it.
    pub fn start_of_object(&self, addr: usize) -> usize {
        if !self.is_owned(addr) {
            return addr;
        }
        sizeclass::start_of_object(self.backend.get_entry(addr).sizeclass(), addr)
    }

    /// Whether `addr` lies in a chunk handed to some heap.
    pub fn is_owned(&self, addr: usize) -> bool {
        let entry = self.backend.get_entry(addr);
        !entry.is_unowned() && !entry.is_backend_owned()
    }

    /// The client metadata word of the object containing `addr`, zeroed when
    /// its slab was created.
    ///
    /// # Safety
    ///
    /// The object must stay allocated while the returned word is in use.
    pub unsafe fn client_meta(&self, addr: usize) -> Option<&AtomicUsize> {
        if !self.is_owned(addr) {
            return None;
        }
        let entry = self.backend.get_entry(addr);
        let sc = entry.sizeclass();
        let slab = addr & !(sizeclass::sizeclass_full_to_slab_size(sc) - 1);
        let index = (addr - slab) / sizeclass::sizeclass_full_to_size(sc);
        // SAFETY: the chunk is heap-owned and its slab outlives the object.
        unsafe { entry.meta() }?.client_meta(index)
    }

    pub fn stats(&self) -> Stat {
        self.backend.stats().snapshot()
    }
}

/// A heap taken from a [`Pool`], flushed and handed back on drop.
pub struct PooledHeap<'g, P: Pal> {
    heap: &'g Heap<'g, P>,
    pool: &'g Pool<'g, P>,
}

impl<P: Pal> fmt::Debug for PooledHeap<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.heap, f)
    }
}

impl<'g, P: Pal> PooledHeap<'g, P> {
    /// Detaches the heap from the guard. It must be given back with
    /// [`release`](Self::release).
    pub fn into_raw(self) -> &'g Heap<'g, P> {
        ManuallyDrop::new(self).heap
    }

    /// Flushes `heap` and puts it back into `pool`.
    ///
    /// # Safety
    ///
    /// `heap` must come from [`into_raw`](Self::into_raw) of a guard over
    /// `pool`, and must not be used afterwards.
    pub unsafe fn release(pool: &'g Pool<'g, P>, heap: &'g Heap<'g, P>) {
        heap.flush();
        // SAFETY: see the contract.
        unsafe { pool.release(heap) }
    }
}

impl<'g, P: Pal> Deref for PooledHeap<'g, P> {
    type Target = Heap<'g, P>;

    fn deref(&self) -> &Self::Target {
        self.heap
    }
}

impl<P: Pal> Drop for PooledHeap<'_, P> {
    fn drop(&mut self) {
        // SAFETY: the guard owns the heap until now.
        unsafe { Self::release(self.pool, self.heap) }
    }
}

#[cfg(all(test, feature = "libc"))]
mod tests {
    use std::{boxed::Box, thread, vec::Vec};

    use super::*;
    use crate::pal::UnixPal;

    fn globals(mitigations: Mitigations) -> &'static Globals<'static, UnixPal> {
        Box::leak(Box::new(Globals::new(UnixPal::new(false), mitigations)))
    }

    #[test]
    fn queries() {
        let globals = globals(Mitigations::SANITY_CHECKS);
        assert!(globals.key().is_none());
        let heap = globals.acquire().unwrap();
        assert!(globals.key().is_some());

        let ptr = heap.alloc(100).unwrap();
        let addr = ptr.addr().get();
        let size = globals.alloc_size(ptr.as_ptr());
        assert_eq!(size, sizeclass::round_size(100));
        assert!(globals.is_owned(addr + 50));
        assert_eq!(globals.start_of_object(addr + 50), addr);
        assert_eq!(globals.remaining_bytes(addr + 50), size - 50);

        let local = 0u64;
        let local = core::ptr::from_ref(&local).addr();
        assert!(!globals.is_owned(local));
        assert_eq!(globals.alloc_size(core::ptr::without_provenance(local)), 0);
        assert_eq!(globals.start_of_object(local), local);
        assert!(globals.remaining_bytes(local) > 1 << 40);

        let word = unsafe { globals.client_meta(addr + 50) }.unwrap();
        assert_eq!(word.load(core::sync::atomic::Ordering::Relaxed), 0);
        word.store(7, core::sync::atomic::Ordering::Relaxed);
        assert_eq!(unsafe { globals.client_meta(addr) }.unwrap().load(core::sync::atomic::Ordering::Relaxed), 7);
        assert!(unsafe { globals.client_meta(local) }.is_none());

        unsafe { heap.dealloc(ptr.as_ptr()) };
        assert!(globals.stats().heaps >= 1);
    }

    #[test]
    fn guards_recycle_heaps() {
        let globals = globals(Mitigations::NONE);
        let id = {
            let heap = globals.acquire().unwrap();
            let ptr = heap.alloc(24).unwrap();
            unsafe { heap.dealloc(ptr.as_ptr()) };
            heap.id()
        };
        let heap = globals.acquire().unwrap();
        assert_eq!(heap.id(), id);
        heap.debug_is_empty().unwrap();
    }

    #[test]
    fn cross_thread_frees() {
        let globals = globals(Mitigations::FREELIST_FORWARD_EDGE.union(Mitigations::SANITY_CHECKS));
        let producer = globals.acquire().unwrap();
        let ptrs: Vec<usize> = (0..5000).map(|i| producer.alloc(16 + i % 3000).unwrap().as_ptr().expose_provenance()).collect();

        let handles: Vec<_> = ptrs
            .chunks(1000)
            .map(|chunk| {
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    let heap = globals.acquire().unwrap();
                    for addr in chunk {
                        unsafe { heap.dealloc(core::ptr::with_exposed_provenance_mut(addr)) };
                    }
                })
            })
            .collect();
        handles.into_iter().for_each(|h| h.join().unwrap());
        // The guards flushed on drop, so every object is queued at the
        // producer by now.
        producer.debug_is_empty().unwrap();
    }
}
