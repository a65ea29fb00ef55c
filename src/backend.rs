//! The address-space manager.
//!
//! The backend hands chunks to heaps and records their owners in the
//! [`Pagemap`]. Address space flows through a pipeline of [`Range`]s: a
//! process-wide pipeline reserving from the OS, shared under a lock, feeds
//! per-heap caches kept in a [`LocalState`].

pub mod buddy;
pub mod pagemap;
pub mod range;
pub mod tree;

use core::ptr::NonNull;

pub use self::pagemap::{Entry, MetaEntry, Pagemap};
use self::range::{
    CommitRange, GlobalSource, LargeBuddy, LockRange, LogRange, MetaSource, PagemapRegister,
    PalRange, Range, SmallBuddy, StatsRange,
};
use crate::{
    aal::ADDRESS_BITS,
    config::{GLOBAL_REFILL_BITS, LOCAL_CACHE_BITS, Mitigations},
    entropy::FreeListKey,
    error::Error,
    pal::Pal,
    sizeclass::SizeClass,
    slab::SlabMetadata,
    stat::Stats,
    sync::Singleton,
};

/// What every stage of a pipeline may need besides its parent.
pub struct Context<'a, P: Pal> {
    pub pal: &'a P,
    pub pagemap: &'a Pagemap,
    pub stats: &'a Stats,
    pub mitigations: Mitigations,
    pub global: &'a GlobalRange,
    pub global_meta: &'a GlobalRange,
}

/// The process-wide pipeline: OS reservations, registered in the pagemap,
/// cached in a buddy allocator.
pub type GlobalRange = LockRange<LogRange<LargeBuddy<PagemapRegister<PalRange>>>>;

/// A heap's cache of committed chunks.
pub type ObjectRange = LargeBuddy<CommitRange<StatsRange<GlobalSource>>>;

/// A heap's cache of metadata blocks.
pub type MetaRange = SmallBuddy<LargeBuddy<CommitRange<StatsRange<MetaSource>>>>;

const fn global_range(name: &'static str) -> GlobalRange {
    let source = PagemapRegister::new(PalRange::new());
    LockRange::new(LogRange::new(
        LargeBuddy::new(source, GLOBAL_REFILL_BITS, ADDRESS_BITS),
        name,
    ))
}

const fn meta_range() -> MetaRange {
    let source = CommitRange::new(StatsRange::new(MetaSource));
    SmallBuddy::new(LargeBuddy::new(source, LOCAL_CACHE_BITS, LOCAL_CACHE_BITS))
}

/// The address-space caches owned by one heap.
#[derive(Debug)]
pub struct LocalState {
    object: ObjectRange,
    meta: MetaRange,
}

impl Default for LocalState {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalState {
    pub const fn new() -> Self {
        LocalState {
            object: LargeBuddy::new(
                CommitRange::new(StatsRange::new(GlobalSource)),
                LOCAL_CACHE_BITS,
                LOCAL_CACHE_BITS,
            ),
            meta: meta_range(),
        }
    }
}

pub struct Backend<P: Pal> {
    pal: P,
    pagemap: Pagemap,
    stats: Stats,
    mitigations: Mitigations,
    global: GlobalRange,
    global_meta: GlobalRange,
    bootstrap: LockRange<MetaRange>,
    /// Links between objects of this backend's chunks are encoded with this
    /// key, whichever heap writes them.
    key: Singleton<FreeListKey>,
}

impl<P: Pal + core::fmt::Debug> core::fmt::Debug for Backend<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Backend")
            .field("pal", &self.pal)
            .field("pagemap", &self.pagemap)
            .field("mitigations", &self.mitigations)
            .finish_non_exhaustive()
    }
}

impl<P: Pal> Backend<P> {
    pub const fn new(pal: P, mitigations: Mitigations) -> Self {
        Backend {
            pal,
            pagemap: Pagemap::new(),
            stats: Stats::INIT,
            mitigations,
            global: global_range("objects"),
            global_meta: global_range("metadata"),
            bootstrap: LockRange::new(meta_range()),
            key: Singleton::new(),
        }
    }

    /// The free list key shared by every heap over this backend, drawn on
    /// first use.
    pub fn key(&self) -> FreeListKey {
        *self.key.get_or_init(|| FreeListKey::random(&self.pal, self.mitigations))
    }

    /// Reserves the pagemap. Must succeed before anything is allocated.
    pub fn init(&self) -> Result<(), Error> {
        self.pagemap.init(&self.pal, self.mitigations)
    }

    pub fn cx(&self) -> Context<'_, P> {
        Context {
            pal: &self.pal,
            pagemap: &self.pagemap,
            stats: &self.stats,
            mitigations: self.mitigations,
            global: &self.global,
            global_meta: &self.global_meta,
        }
    }

    pub fn pal(&self) -> &P {
        &self.pal
    }

    pub fn pagemap(&self) -> &Pagemap {
        &self.pagemap
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn mitigations(&self) -> Mitigations {
        self.mitigations
    }

    #[inline]
    pub fn get_entry(&self, addr: usize) -> MetaEntry {
        self.pagemap.get(addr)
    }

    /// Allocates `size` bytes of metadata, from the heap's own cache if there
    /// is one and from a shared cache otherwise.
    ///
    /// Blocks are aligned to their size rounded up to a power of two.
    pub fn alloc_meta_data(&self, local: Option<&mut LocalState>, size: usize) -> Option<NonNull<u8>> {
        let cx = self.cx();
        match local {
            Some(local) => local.meta.alloc_range(&cx, size),
            None => self.bootstrap.alloc_shared(&cx, size),
        }
    }

    /// # Safety
    ///
    /// `ptr` and `size` must describe a block from
    /// [`alloc_meta_data`](Self::alloc_meta_data), no longer in use.
    pub unsafe fn dealloc_meta_data(&self, local: Option<&mut LocalState>, ptr: NonNull<u8>, size: usize) {
        let cx = self.cx();
        // SAFETY: see the contract.
        unsafe {
            match local {
                Some(local) => local.meta.dealloc_range(&cx, ptr, size),
                None => self.bootstrap.dealloc_shared(&cx, ptr, size),
            }
        }
    }

    /// Allocates a chunk of `size` bytes, a power of two, owned by the heap
    /// whose queue is `remote`, along with its metadata.
    ///
    /// The metadata is constructed but not initialised.
    pub fn alloc_chunk<'g>(
        &'g self,
        local: &mut LocalState,
        size: usize,
        sc: SizeClass,
        remote: usize,
    ) -> Option<(NonNull<u8>, &'g SlabMetadata<'g>)> {
        debug_assert!(crate::bits::is_pow2(size));
        let client_words = SlabMetadata::client_words(sc);
        let meta_size = SlabMetadata::alloc_size(client_words);
        let meta_ptr = self.alloc_meta_data(Some(local), meta_size)?;

        let cx = self.cx();
        let Some(chunk) = local.object.alloc_range(&cx, size) else {
            // SAFETY: the block was just allocated and is unused.
            unsafe { self.dealloc_meta_data(Some(local), meta_ptr, meta_size) };
            return None;
        };
        // SAFETY: the block is fresh metadata memory of `meta_size` bytes, and
        // it lives until `dealloc_chunk`, which the heap never outlives.
        let meta = unsafe { SlabMetadata::new_in(meta_ptr, client_words) };
        self.pagemap
            .set_range(chunk.addr().get(), size, MetaEntry::new(Some(meta), remote, sc));
        Some((chunk, meta))
    }

    /// Returns a chunk and its metadata.
    ///
    /// # Safety
    ///
    /// `chunk` of `size` bytes must come from
    /// [`alloc_chunk`](Self::alloc_chunk) along with `meta`, and neither may
    /// be used afterwards.
    pub unsafe fn dealloc_chunk(
        &self,
        local: &mut LocalState,
        meta: &SlabMetadata<'_>,
        chunk: NonNull<u8>,
        size: usize,
    ) {
        let client_words = SlabMetadata::client_words(meta.sizeclass());
        let meta_ptr = NonNull::from(meta).cast::<u8>();
        self.pagemap.set_range(chunk.addr().get(), size, MetaEntry::UNOWNED);

        let cx = self.cx();
        // SAFETY: see the contract.
        unsafe {
            local.object.dealloc_range(&cx, chunk, size);
            self.dealloc_meta_data(Some(local), meta_ptr, SlabMetadata::alloc_size(client_words));
        }
    }
}
