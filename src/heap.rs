//! The per-thread allocator.
//!
//! A [`Heap`] owns slabs and large chunks. Each small size class keeps a
//! *fast* free list, handed out by one slab at a time, and a list of
//! available slabs to refill it from. Slabs that handed out their whole free
//! list sleep in the `laden` list until enough of their objects come back.
//!
//! Only the owning thread touches a heap's slabs. Objects of other heaps are
//! batched in a [`RemoteDeallocCache`] and posted to their owners' queues;
//! objects posted to this heap are picked up from its [`RemoteAllocator`]
//! on frees, large allocations and whenever the small slow path runs.

use core::{
    cell::{Cell, UnsafeCell},
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr},
};

use crate::{
    backend::{Backend, LocalState, MetaEntry},
    bits,
    config::{Mitigations, REMOTE_BATCH_LIMIT},
    entropy::{FreeListKey, LocalEntropy},
    error::{Corruption, Error},
    pal::{self, Pal},
    remote::{self, RemoteAllocator, RemoteDeallocCache},
    sizeclass::{self, MIN_CHUNK_SIZE, NUM_SMALL_SIZECLASSES, SizeClass},
    slab::{FreeObject, FreePtr, Iter, SlabList, SlabMetadata},
    sync::AbaLinked,
    track,
};

/// The available slabs of one size class.
struct SlabCache<'g> {
    available: SlabList<'g, SlabMetadata<'g>>,
    /// How many of `available` have every object free.
    unused: Cell<u16>,
    /// `available.len()`, kept narrow.
    length: Cell<u16>,
}

impl SlabCache<'_> {
    const fn new() -> Self {
        SlabCache { available: SlabList::new(), unused: Cell::new(0), length: Cell::new(0) }
    }
}

/// A thread-caching allocator.
///
/// Heaps live in metadata memory for the rest of the process and are reused
/// through a [`Pool`](crate::pool::Pool). The message queue comes first, so
/// the address of a heap is its identity and is aligned like the queue.
#[repr(C)]
pub struct Heap<'g, P: Pal> {
    remote_alloc: RemoteAllocator,
    backend: &'g Backend<P>,
    key: FreeListKey,
    queue_key: FreeListKey,
    mitigations: Mitigations,

    fast: [Cell<Iter>; NUM_SMALL_SIZECLASSES],
    classes: [SlabCache<'g>; NUM_SMALL_SIZECLASSES],
    /// Sleeping slabs and large allocations.
    laden: SlabList<'g, SlabMetadata<'g>>,

    remote_cache: UnsafeCell<RemoteDeallocCache>,
    entropy: UnsafeCell<LocalEntropy>,
    local: UnsafeCell<LocalState>,

    pool_next: AtomicPtr<Self>,
    all_next: AtomicPtr<Self>,
    in_use: AtomicBool,
}

// SAFETY: a heap is used by one thread at a time; the pool hands it over
// with acquire-release synchronization. Other threads only ever touch its
// message queue, which is thread-safe.
unsafe impl<P: Pal> Send for Heap<'_, P> {}
unsafe impl<P: Pal> Sync for Heap<'_, P> {}

impl<P: Pal> AbaLinked for Heap<'_, P> {
    fn aba_next(&self) -> &AtomicPtr<Self> {
        &self.pool_next
    }
}

impl<P: Pal> fmt::Debug for Heap<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("id", &format_args!("{:#x}", self.id()))
            .field("mitigations", &self.mitigations)
            .field("laden", &self.laden.len())
            .finish_non_exhaustive()
    }
}

impl<'g, P: Pal> Heap<'g, P> {
    /// The log2 of the alignment every heap is placed at.
    pub const ID_SHIFT: usize = bits::next_pow2_bits(size_of::<Self>());

    /// Creates a heap. It must be [`init`](Self::init)ialized in its final
    /// place, preferably aligned to `1 << ID_SHIFT` so that identities spread
    /// over the remote cache's slots.
    ///
    /// Objects travel between the heaps of one backend with links encoded by
    /// the sender, so every heap takes the backend's [`key`](Backend::key).
    pub fn new(backend: &'g Backend<P>) -> Self {
        let key = backend.key();
        Heap {
            remote_alloc: RemoteAllocator::new(),
            backend,
            key,
            queue_key: key.for_queues(),
            mitigations: backend.mitigations(),
            fast: [const { Cell::new(Iter::empty()) }; NUM_SMALL_SIZECLASSES],
            classes: [const { SlabCache::new() }; NUM_SMALL_SIZECLASSES],
            laden: SlabList::new(),
            remote_cache: UnsafeCell::new(RemoteDeallocCache::new(Self::ID_SHIFT)),
            entropy: UnsafeCell::new(LocalEntropy::new(backend.pal())),
            local: UnsafeCell::new(LocalState::new()),
            pool_next: AtomicPtr::new(ptr::null_mut()),
            all_next: AtomicPtr::new(ptr::null_mut()),
            in_use: AtomicBool::new(false),
        }
    }

    /// Readies the message queue. The heap must not move afterwards.
    pub fn init(&self) {
        self.remote_alloc.init(&self.queue_key);
    }

    /// The identity of this heap, recorded in the pagemap for every chunk it
    /// owns.
    #[inline]
    pub fn id(&self) -> usize {
        self.remote_alloc.id()
    }

    pub fn backend(&self) -> &'g Backend<P> {
        self.backend
    }

    pub fn mitigations(&self) -> Mitigations {
        self.mitigations
    }

    pub(crate) fn all_next(&self) -> &AtomicPtr<Self> {
        &self.all_next
    }

    pub(crate) fn in_use(&self) -> &AtomicBool {
        &self.in_use
    }

    #[inline]
    fn checks(&self) -> bool {
        self.mitigations.contains(Mitigations::SANITY_CHECKS)
    }

    #[cold]
    fn fatal(&self, err: Error) -> ! {
        pal::fatal(self.backend.pal(), err)
    }

    #[inline]
    fn check<T>(&self, result: Result<T, Corruption>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => self.fatal(err.into()),
        }
    }

    fn with_local<R>(&self, f: impl FnOnce(&mut LocalState) -> R) -> R {
        // SAFETY: the heap is single-threaded and `f` never reenters.
        f(unsafe { &mut *self.local.get() })
    }

    fn with_entropy<R>(&self, f: impl FnOnce(&mut LocalEntropy) -> R) -> R {
        // SAFETY: as above.
        f(unsafe { &mut *self.entropy.get() })
    }

    fn with_remote_cache<R>(&self, f: impl FnOnce(&mut RemoteDeallocCache) -> R) -> R {
        // SAFETY: as above.
        f(unsafe { &mut *self.remote_cache.get() })
    }

    // ---------------------------------------------------------------------
    // Allocation

    /// Allocates `size` bytes, aligned to the natural alignment of `size`.
    ///
    /// Zero-sized requests get the smallest object. Only exhaustion is
    /// reported; corruption found on the way terminates the process.
    #[inline]
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let ptr = if sizeclass::is_small_sizeclass(size) {
            self.small_alloc(sizeclass::size_to_sizeclass(size))?
        } else {
            self.alloc_not_small(size)?
        };
        track::allocate(ptr, size, false);
        Ok(ptr)
    }

    pub fn alloc_zeroed(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let ptr = self.alloc(size)?;
        if sizeclass::is_small_sizeclass(size) {
            // SAFETY: the object holds at least `size` bytes.
            unsafe { ptr.write_bytes(0, size) };
        } else if size > 0 {
            // SAFETY: large objects are whole pages of their own chunk.
            unsafe { self.backend.pal().zero(ptr, bits::align_up(size, P::PAGE_SIZE)) };
        }
        Ok(ptr)
    }

    /// Allocates for `size` bytes aligned to `align`, a power of two, by
    /// picking a class whose natural alignment suffices.
    pub fn alloc_aligned(&self, align: usize, size: usize) -> Result<NonNull<u8>, Error> {
        match sizeclass::aligned_size(align, size.max(1)) {
            usize::MAX => Err(Error::OutOfMemory { size }),
            rsize => self.alloc(rsize),
        }
    }

    #[inline]
    fn small_alloc(&self, sc: usize) -> Result<NonNull<u8>, Error> {
        let fast = &self.fast[sc];
        let mut list = fast.get();
        let head = list.peek().map_or(0, |p| p.addr());
        let checks = self.checks();
        let slab_size = sizeclass::sizeclass_to_slab_size(sc);
        match list.take(&self.key, |next| !checks || (next ^ head) < slab_size) {
            Ok(Some(obj)) => {
                fast.set(list);
                Ok(obj.as_non_null().cast())
            }
            Ok(None) => self.small_alloc_slow(sc),
            Err(err) => self.fatal(err.into()),
        }
    }

    #[cold]
    fn small_alloc_slow(&self, sc: usize) -> Result<NonNull<u8>, Error> {
        self.handle_message_queue();
        self.small_refill(sc)
    }

    /// Refills the fast list of `sc` from a cached slab, or a new one.
    fn small_refill(&self, sc: usize) -> Result<NonNull<u8>, Error> {
        let class = &self.classes[sc];
        if self.mitigations.contains(Mitigations::RANDOM_EXTRA_SLAB)
            && class.length.get() == 1
            && self.with_entropy(|e| e.next_bit()) == 0
        {
            return self.small_refill_slow(sc);
        }

        let meta = if self.mitigations.contains(Mitigations::REUSE_LIFO) {
            class.available.pop_front()
        } else {
            class.available.pop_back()
        };
        let Some(meta) = meta else { return self.small_refill_slow(sc) };
        class.length.set(class.length.get() - 1);
        if meta.needed() == 0 {
            class.unused.set(class.unused.get() - 1);
        }
        self.alloc_from_slab(sc, meta)
    }

    #[cold]
    fn small_refill_slow(&self, sc: usize) -> Result<NonNull<u8>, Error> {
        let slab_size = sizeclass::sizeclass_to_slab_size(sc);
        let chunk = self.with_local(|local| {
            self.backend.alloc_chunk(local, slab_size, SizeClass::from_small(sc), self.id())
        });
        let Some((chunk, meta)) = chunk else {
            return Err(Error::OutOfMemory { size: sizeclass::sizeclass_to_size(sc) });
        };
        meta.initialise(sc, chunk.as_ptr().expose_provenance(), self.mitigations);
        self.alloc_new_list(chunk, meta, sc);
        self.alloc_from_slab(sc, meta)
    }

    /// Hands the free list of `meta` to the fast list and files the slab.
    fn alloc_from_slab(&self, sc: usize, meta: &'g SlabMetadata<'g>) -> Result<NonNull<u8>, Error> {
        let result = self.with_entropy(|e| meta.alloc_free_list(&self.key, e, self.mitigations));
        let (first, rest, active) = self.check(result);
        self.fast[sc].set(rest);
        if active {
            let class = &self.classes[sc];
            class.available.push(meta);
            class.length.set(class.length.get() + 1);
        } else {
            self.laden.push(meta);
        }
        Ok(first.as_non_null().cast())
    }

    /// Threads every object of a fresh slab into its free list.
    ///
    /// With `random-initial` the order is a random cycle, drawn with
    /// Sattolo's algorithm through the first word of each object.
    fn alloc_new_list(&self, chunk: NonNull<u8>, meta: &'g SlabMetadata<'g>, sc: usize) {
        let size = sizeclass::sizeclass_to_size(sc);
        let count = sizeclass::sizeclass_to_slab_object_count(sc) as usize;
        // SAFETY: every index is below the object count of the slab.
        let object = |i: usize| unsafe { chunk.add(i * size) };
        let word = |i: usize| object(i).cast::<usize>();

        self.with_entropy(|entropy| {
            if !self.mitigations.contains(Mitigations::RANDOM_INITIAL) {
                for i in 0..count {
                    // SAFETY: the slab is fresh and owned by this heap.
                    let obj = unsafe { FreeObject::make(object(i)) };
                    meta.push_free(obj, &self.key, entropy);
                }
                return;
            }

            // SAFETY (all accesses below): the words are the first word of
            // objects of the fresh slab.
            unsafe { word(0).write(0) };
            for i in 1..count {
                let j = entropy.sample(i);
                unsafe {
                    word(i).write(word(j).read());
                    word(j).write(i);
                }
            }
            let start = unsafe { word(entropy.sample(count)).read() };
            let mut curr = start;
            loop {
                let next = unsafe { word(curr).read() };
                let obj = unsafe { FreeObject::make(object(curr)) };
                meta.push_free(obj, &self.key, entropy);
                curr = next;
                if curr == start {
                    break;
                }
            }
        });
    }

    #[cold]
    fn alloc_not_small(&self, size: usize) -> Result<NonNull<u8>, Error> {
        if size == 0 {
            return self.small_alloc(sizeclass::size_to_sizeclass(1));
        }
        if size > bits::one_at_bit(bits::BITS - 1) {
            return Err(Error::OutOfMemory { size });
        }
        self.handle_message_queue();
        let chunk_size = bits::next_pow2(size).max(MIN_CHUNK_SIZE);
        let sc = sizeclass::size_to_sizeclass_full(size);
        let chunk = self.with_local(|local| self.backend.alloc_chunk(local, chunk_size, sc, self.id()));
        let Some((chunk, meta)) = chunk else { return Err(Error::OutOfMemory { size }) };
        meta.initialise_large(sc, chunk.as_ptr().expose_provenance());
        self.laden.push(meta);
        Ok(chunk)
    }

    // ---------------------------------------------------------------------
    // Deallocation

    /// Frees `ptr`, which may belong to any heap of the same backend.
    ///
    /// Freeing null does nothing.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or an allocation of this backend not freed since.
    /// Pointers that are not are reported as corruption as far as the
    /// enabled checks detect them.
    #[inline]
    pub unsafe fn dealloc(&self, ptr: *mut u8) {
        self.handle_message_queue();
        let entry = self.backend.get_entry(ptr.addr());
        if !entry.is_backend_owned() && entry.remote() == self.id() {
            if let Some(ptr) = NonNull::new(ptr) {
                track::deallocate(ptr);
                return self.dealloc_local_object(ptr, entry);
            }
        }
        self.dealloc_remote(ptr, entry)
    }

    /// Like [`dealloc`](Self::dealloc), also checking that the object holds
    /// at least `size` bytes.
    ///
    /// # Safety
    ///
    /// See [`dealloc`](Self::dealloc).
    pub unsafe fn dealloc_sized(&self, ptr: *mut u8, size: usize) {
        if self.checks() && !ptr.is_null() {
            let entry = self.backend.get_entry(ptr.addr());
            if !entry.is_unowned() && !entry.is_backend_owned() && size > sizeclass::sizeclass_full_to_size(entry.sizeclass()) {
                self.fatal(Corruption::SizeMismatch { addr: ptr.addr(), size }.into());
            }
        }
        // SAFETY: see the contract.
        unsafe { self.dealloc(ptr) }
    }

    #[inline]
    fn dealloc_local_object(&self, ptr: NonNull<u8>, entry: MetaEntry) {
        // SAFETY: the entry names this heap, which keeps its metadata alive.
        let Some(meta) = (unsafe { entry.meta() }) else {
            self.fatal(Corruption::NotOwned { addr: ptr.addr().get() }.into())
        };
        let addr = ptr.addr().get();
        if self.checks() {
            if !sizeclass::is_start_of_object(entry.sizeclass(), addr) {
                self.fatal(Corruption::NotStartOfObject { addr }.into());
            }
            if meta.is_unused() {
                self.fatal(Corruption::DoubleFree { addr }.into());
            }
        }
        // SAFETY: the object is ours and no longer in use.
        let obj = unsafe { FreeObject::make(ptr) };
        self.with_entropy(|e| meta.push_free(obj, &self.key, e));
        if meta.return_object() {
            self.dealloc_local_object_slow(entry, meta);
        }
    }

    /// Handles the transition of a slab whose wait count reached zero.
    #[cold]
    fn dealloc_local_object_slow(&self, entry: MetaEntry, meta: &'g SlabMetadata<'g>) {
        if meta.is_large() {
            self.laden.remove(meta);
            let size = sizeclass::sizeclass_full_to_slab_size(entry.sizeclass());
            let chunk = ptr::with_exposed_provenance_mut::<u8>(meta.chunk());
            let Some(chunk) = NonNull::new(chunk) else {
                self.fatal(Corruption::NotOwned { addr: 0 }.into())
            };
            // SAFETY: the only object of the chunk has just been freed.
            self.with_local(|local| unsafe { self.backend.dealloc_chunk(local, meta, chunk, size) });
            return;
        }

        let sc = entry.sizeclass().as_small();
        let class = &self.classes[sc];
        if meta.is_sleeping() {
            meta.set_not_sleeping(sc, self.mitigations);
            self.laden.remove(meta);
            class.available.push(meta);
            class.length.set(class.length.get() + 1);
            return;
        }

        let unused = class.unused.get() + 1;
        class.unused.set(unused);
        if unused > 2 && unused > class.length.get() / 4 {
            self.dealloc_local_slabs(sc);
        }
    }

    /// Returns every unused slab of `sc` to the backend.
    fn dealloc_local_slabs(&self, sc: usize) {
        let class = &self.classes[sc];
        for meta in class.available.drain(|meta| meta.needed() == 0) {
            class.length.set(class.length.get() - 1);
            class.unused.set(class.unused.get() - 1);
            self.clear_slab(meta, sc);
        }
    }

    /// Checks that every object of an unused slab is in its free list, then
    /// releases the slab.
    fn clear_slab(&self, meta: &'g SlabMetadata<'g>, sc: usize) {
        let tweak = meta.as_key_tweak();
        let mut count = 0;
        let walked: Result<(), Corruption> = meta.with_queue(|queue| {
            loop {
                let (mut iter, more) = queue.close(&self.key, tweak);
                while iter.take(&self.key, |addr| meta.contains(addr))?.is_some() {
                    count += 1;
                }
                if more == 0 {
                    break Ok(());
                }
            }
        });
        self.check(walked);
        if count != sizeclass::sizeclass_to_slab_object_count(sc) {
            self.fatal(Corruption::FreeList.into());
        }

        let chunk = ptr::with_exposed_provenance_mut::<u8>(meta.chunk());
        let Some(chunk) = NonNull::new(chunk) else { self.fatal(Corruption::FreeList.into()) };
        let size = sizeclass::sizeclass_to_slab_size(sc);
        // SAFETY: every object of the slab is free.
        self.with_local(|local| unsafe { self.backend.dealloc_chunk(local, meta, chunk, size) });
    }

    /// Frees an object this heap does not own, or reports a pointer no heap
    /// owns.
    fn dealloc_remote(&self, ptr: *mut u8, entry: MetaEntry) {
        let addr = ptr.addr();
        if entry.is_backend_owned() {
            self.fatal(Corruption::BackendOwned { addr }.into());
        }
        let Some(nn) = NonNull::new(ptr).filter(|_| !entry.is_unowned()) else {
            if ptr.is_null() {
                return;
            }
            self.fatal(Corruption::NotOwned { addr }.into())
        };
        if self.checks() && !sizeclass::is_start_of_object(entry.sizeclass(), addr) {
            self.fatal(Corruption::NotStartOfObject { addr }.into());
        }
        track::deallocate(nn);

        // SAFETY: the object is dead; only its owner reads it from now on.
        let obj = unsafe { FreeObject::make(nn) };
        if self.with_remote_cache(|cache| cache.reserve_space(&entry, 1)) {
            self.with_remote_cache(|cache| {
                self.with_entropy(|e| cache.dealloc(&entry, obj, &self.key, &self.queue_key, e))
            });
        } else {
            self.dealloc_remote_slow(entry, obj);
        }
    }

    #[cold]
    fn dealloc_remote_slow(&self, entry: MetaEntry, obj: FreePtr) {
        self.with_remote_cache(|cache| {
            self.with_entropy(|e| cache.dealloc(&entry, obj, &self.key, &self.queue_key, e))
        });
        self.post();
    }

    /// Sends every batched foreign object to its owner.
    fn post(&self) -> bool {
        let backend = self.backend;
        let sent = self.with_remote_cache(|cache| {
            cache.post(self.id(), &self.key, &self.queue_key, |addr| backend.get_entry(addr))
        });
        self.check(sent)
    }

    // ---------------------------------------------------------------------
    // Messages

    /// Takes in objects other heaps have posted to this one.
    #[inline]
    pub fn handle_message_queue(&self) {
        if self.remote_alloc.can_dequeue() {
            self.handle_message_queue_slow(REMOTE_BATCH_LIMIT);
        }
    }

    /// Processes messages until `limit` bytes have been taken in.
    #[cold]
    fn handle_message_queue_slow(&self, limit: usize) {
        let backend = self.backend;
        let mut need_post = false;
        let mut bytes = 0;
        let domesticate = |addr| {
            let entry = backend.get_entry(addr);
            !entry.is_unowned() && !entry.is_backend_owned()
        };
        let result = self.remote_alloc.dequeue(&self.queue_key, domesticate, |msg| {
            let entry = backend.get_entry(msg.addr());
            self.handle_dealloc_remote(entry, msg, &mut need_post, &mut bytes);
            bytes < limit
        });
        self.check(result);
        if need_post {
            self.post();
        }
    }

    /// Splices a message for this heap into its slab, or forwards a message
    /// that reached the wrong heap.
    fn handle_dealloc_remote(&self, entry: MetaEntry, msg: FreePtr, need_post: &mut bool, bytes: &mut usize) {
        if entry.remote() != self.id() {
            let len = remote::ring_len(msg, &self.key, entry.key_tweak());
            if !*need_post && !self.with_remote_cache(|cache| cache.reserve_space(&entry, len)) {
                *need_post = true;
            }
            self.with_remote_cache(|cache| cache.forward(entry.remote(), msg, &self.queue_key));
            return;
        }

        // SAFETY: the entry names this heap, which keeps its metadata alive.
        let Some(meta) = (unsafe { entry.meta() }) else {
            self.fatal(Corruption::BadMessage { addr: msg.addr() }.into())
        };
        let sc = entry.sizeclass();
        if self.checks() && !sizeclass::is_start_of_object(sc, msg.addr()) {
            self.fatal(Corruption::NotStartOfObject { addr: msg.addr() }.into());
        }
        let tweak = meta.as_key_tweak();
        let (first, len) = self.check(remote::open_ring(msg, sc, &self.key, tweak, self.checks()));
        *bytes += len as usize * sizeclass::sizeclass_full_to_size(sc);

        if meta.is_unused() {
            self.fatal(Corruption::DoubleFree { addr: first.addr() }.into());
        }
        meta.with_queue(|queue| {
            self.with_entropy(|e| queue.append_segment(first, msg, len, &self.key, tweak, e))
        });
        self.return_objects(entry, meta, len, first.addr());
    }

    /// Accounts for `n` objects returned to `meta` at once, running every
    /// transition on the way.
    fn return_objects(&self, entry: MetaEntry, meta: &'g SlabMetadata<'g>, mut n: u16, addr: usize) {
        while meta.return_objects(&mut n) {
            // Past the final transition the slab may be released, so no
            // object may be left over.
            if n > 0 && (meta.is_large() || !meta.is_sleeping()) {
                self.fatal(Corruption::DoubleFree { addr }.into());
            }
            self.dealloc_local_object_slow(entry, meta);
            if n == 0 {
                break;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Teardown

    /// Returns everything this heap caches: pending messages are taken in,
    /// the fast lists are freed, foreign objects are posted, and unused
    /// slabs go back to the backend.
    ///
    /// Returns whether anything was posted to other heaps.
    pub fn flush(&self) -> bool {
        if self.remote_alloc.can_dequeue() {
            self.handle_message_queue_slow(usize::MAX);
        }

        let checks = self.checks();
        for (sc, fast) in self.fast.iter().enumerate() {
            let mut list = fast.replace(Iter::empty());
            let slab_size = sizeclass::sizeclass_to_slab_size(sc);
            loop {
                let head = list.peek().map_or(0, |p| p.addr());
                let taken = list.take(&self.key, |next| !checks || (next ^ head) < slab_size);
                let Some(obj) = self.check(taken) else { break };
                let entry = self.backend.get_entry(obj.addr());
                self.dealloc_local_object(obj.as_non_null().cast(), entry);
            }
        }

        let posted = self.post();
        for sc in 0..NUM_SMALL_SIZECLASSES {
            self.dealloc_local_slabs(sc);
        }
        posted
    }

    /// Flushes the heap and checks that nothing it owns is still allocated.
    pub fn debug_is_empty(&self) -> Result<(), Error> {
        self.flush();
        let cached = self.classes.iter().any(|class| !class.available.is_empty());
        if cached || !self.laden.is_empty() {
            return Err(Corruption::SlabNotEmpty.into());
        }
        Ok(())
    }
}
