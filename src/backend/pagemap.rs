//! The chunk-granularity metadata table.
//!
//! Every chunk of address space the allocator has ever reserved owns one
//! [`Entry`] of two words. A chunk is in one of three states:
//!
//! - unowned: both words zero (the boundary bit aside);
//! - owned by a heap: the metadata word points at its [`SlabMetadata`], the
//!   other word packs the owner's message queue with the size class;
//! - owned by the backend: [`REMOTE_BACKEND_MARKER`] is set and the rest of
//!   both words is private to the backend's free block trees.
//!
//! The table is a two-level radix tree. The directory is reserved up front,
//! leaves are reserved and committed when a range is registered, so lookups
//! of addresses never registered resolve to an unowned entry.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering::*},
};

use crate::{
    aal::ADDRESS_BITS,
    bits,
    config::{MIN_CHUNK_BITS, Mitigations},
    error::Error,
    pal::Pal,
    sizeclass::{MIN_CHUNK_SIZE, SIZECLASS_REP_SIZE, SizeClass},
    slab::SlabMetadata,
};

/// Set in the remote word of backend-owned entries.
pub const REMOTE_BACKEND_MARKER: usize = 1 << 7;
/// Set in the metadata word of the first chunk of every OS reservation.
pub const META_BOUNDARY_BIT: usize = 1;
/// The low bits of both words that the backend's trees must preserve.
pub const BACKEND_RESERVED_MASK: usize = (1 << 8) - 1;

const _: () = assert!(SIZECLASS_REP_SIZE <= REMOTE_BACKEND_MARKER);

const INDEX_BITS: usize = ADDRESS_BITS - MIN_CHUNK_BITS;
const LEAF_BITS: usize = bits::min(INDEX_BITS, 16);
const DIR_BITS: usize = INDEX_BITS - LEAF_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const DIR_LEN: usize = 1 << DIR_BITS;

const LEAF_BYTES: usize = LEAF_LEN * size_of::<Entry>();
const DIR_BYTES: usize = DIR_LEN * size_of::<AtomicPtr<Leaf>>();
/// How many pages the directory may be shifted by under `random-pagemap`.
const RANDOM_PAGES: usize = 256;

/// A snapshot of one pagemap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaEntry {
    meta: usize,
    ras: usize,
}

impl MetaEntry {
    pub const UNOWNED: Self = MetaEntry { meta: 0, ras: 0 };

    /// The entry of a chunk owned by the heap whose queue is at `remote`.
    pub fn new(meta: Option<&SlabMetadata<'_>>, remote: usize, sc: SizeClass) -> Self {
        debug_assert_eq!(remote & (SIZECLASS_REP_SIZE * 2 - 1), 0);
        let meta = meta.map_or(0, |m| ptr::from_ref(m).expose_provenance());
        MetaEntry { meta, ras: remote | sc.raw() }
    }

    #[inline]
    pub fn meta_addr(&self) -> usize {
        self.meta & !META_BOUNDARY_BIT
    }

    /// The slab metadata of a heap-owned chunk.
    ///
    /// # Safety
    ///
    /// The entry must be heap-owned, and the metadata must outlive `'a`.
    #[inline]
    pub unsafe fn meta<'a>(&self) -> Option<&'a SlabMetadata<'a>> {
        let ptr = ptr::with_exposed_provenance::<SlabMetadata<'a>>(self.meta_addr());
        // SAFETY: see the contract.
        unsafe { ptr.as_ref() }
    }

    /// The identity of the owning heap's message queue.
    #[inline]
    pub fn remote(&self) -> usize {
        self.ras & !(SIZECLASS_REP_SIZE * 2 - 1)
    }

    /// The free list tweak of the owning slab.
    #[inline]
    pub fn key_tweak(&self) -> usize {
        SlabMetadata::key_tweak_at(self.meta_addr())
    }

    #[inline]
    pub fn sizeclass(&self) -> SizeClass {
        SizeClass::from_raw(self.ras & (SIZECLASS_REP_SIZE - 1))
    }

    #[inline]
    pub fn is_backend_owned(&self) -> bool {
        self.ras & REMOTE_BACKEND_MARKER != 0
    }

    #[inline]
    pub fn is_unowned(&self) -> bool {
        self.meta_addr() == 0 && self.ras == 0
    }

    #[inline]
    pub fn is_boundary(&self) -> bool {
        self.meta & META_BOUNDARY_BIT != 0
    }
}

/// One slot of the pagemap.
#[derive(Debug, Default)]
#[repr(C)]
pub struct Entry {
    meta: AtomicUsize,
    ras: AtomicUsize,
}

impl Entry {
    #[inline]
    pub fn load(&self) -> MetaEntry {
        MetaEntry { meta: self.meta.load(Relaxed), ras: self.ras.load(Relaxed) }
    }

    /// Overwrites the entry, keeping its boundary bit.
    #[inline]
    pub fn store(&self, entry: MetaEntry) {
        let boundary = self.meta.load(Relaxed) & META_BOUNDARY_BIT;
        self.meta.store(entry.meta_addr() | boundary, Relaxed);
        self.ras.store(entry.ras, Relaxed);
    }

    pub fn set_boundary(&self) {
        self.meta.fetch_or(META_BOUNDARY_BIT, Relaxed);
    }

    /// Hands the entry to the backend, clearing its private bits.
    pub fn claim_for_backend(&self) {
        let boundary = self.meta.load(Relaxed) & META_BOUNDARY_BIT;
        self.meta.store(boundary, Relaxed);
        self.ras.store(REMOTE_BACKEND_MARKER, Relaxed);
    }

    /// The two words, for the backend's private use on backend-owned
    /// entries. The bits in [`BACKEND_RESERVED_MASK`] must be preserved.
    pub fn backend_words(&self) -> (&AtomicUsize, &AtomicUsize) {
        (&self.meta, &self.ras)
    }
}

type Leaf = [Entry; LEAF_LEN];

static EMPTY: Entry = Entry { meta: AtomicUsize::new(0), ras: AtomicUsize::new(0) };

pub struct Pagemap {
    dir: AtomicPtr<AtomicPtr<Leaf>>,
}

impl Default for Pagemap {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Pagemap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pagemap")
            .field("dir", &self.dir.load(Relaxed))
            .finish()
    }
}

impl Pagemap {
    pub const fn new() -> Self {
        Pagemap { dir: AtomicPtr::new(ptr::null_mut()) }
    }

    pub fn is_initialised(&self) -> bool {
        !self.dir.load(Relaxed).is_null()
    }

    /// Reserves the directory. Under `random-pagemap` it is placed at a
    /// random page inside a larger reservation.
    pub fn init<P: Pal>(&self, pal: &P, mitigations: Mitigations) -> Result<(), Error> {
        if self.is_initialised() {
            return Ok(());
        }
        let dir_bytes = bits::align_up(DIR_BYTES, P::PAGE_SIZE);
        let random = mitigations.contains(Mitigations::RANDOM_PAGEMAP);
        let span = if random { dir_bytes + RANDOM_PAGES * P::PAGE_SIZE } else { dir_bytes };

        let base = pal.reserve(span).ok_or(Error::OutOfMemory { size: span })?;
        let offset = if random {
            (pal.entropy64() as usize % RANDOM_PAGES) * P::PAGE_SIZE
        } else {
            0
        };
        // SAFETY: `offset + dir_bytes <= span`.
        let dir = unsafe { base.add(offset) };
        // SAFETY: the range was just reserved.
        if let Err(err) = unsafe { pal.notify_using(dir, dir_bytes) } {
            // SAFETY: the whole reservation is unused.
            unsafe { pal.release(base, span) };
            return Err(err);
        }
        let dir = dir.cast::<AtomicPtr<Leaf>>().as_ptr();
        if self.dir.compare_exchange(ptr::null_mut(), dir, AcqRel, Acquire).is_err() {
            // SAFETY: we lost the race, our reservation is unused.
            unsafe { pal.release(base, span) };
        }
        log_at!(debug, "pagemap directory at {dir:p}");
        Ok(())
    }

    #[inline]
    fn index(addr: usize) -> Option<(usize, usize)> {
        let index = addr >> MIN_CHUNK_BITS;
        (index < 1 << INDEX_BITS).then_some((index >> LEAF_BITS, index & (LEAF_LEN - 1)))
    }

    #[inline]
    fn dir_slot(&self, dir_index: usize) -> Option<&AtomicPtr<Leaf>> {
        let dir = NonNull::new(self.dir.load(Acquire))?;
        debug_assert!(dir_index < DIR_LEN);
        // SAFETY: the directory holds `DIR_LEN` committed slots.
        Some(unsafe { dir.add(dir_index).as_ref() })
    }

    /// The slot of `addr`, if its range was registered.
    #[inline]
    pub fn entry(&self, addr: usize) -> Option<&Entry> {
        let (dir_index, leaf_index) = Self::index(addr)?;
        let leaf = NonNull::new(self.dir_slot(dir_index)?.load(Acquire))?;
        // SAFETY: leaves are committed before being published, and never
        // released.
        Some(unsafe { &leaf.as_ref()[leaf_index] })
    }

    /// The entry of `addr`; unregistered addresses are unowned.
    #[inline]
    pub fn get(&self, addr: usize) -> MetaEntry {
        self.entry(addr).unwrap_or(&EMPTY).load()
    }

    /// Makes sure every chunk of `[base, base + size)` has a slot.
    pub fn register_range<P: Pal>(&self, pal: &P, base: usize, size: usize) -> Result<(), Error> {
        let last = base.checked_add(size - 1).ok_or(Error::OutOfMemory { size })?;
        let (first_dir, _) = Self::index(base).ok_or(Error::OutOfMemory { size })?;
        let (last_dir, _) = Self::index(last).ok_or(Error::OutOfMemory { size })?;
        for dir_index in first_dir..=last_dir {
            let slot = self.dir_slot(dir_index).ok_or(Error::Platform("pagemap not initialised"))?;
            if !slot.load(Acquire).is_null() {
                continue;
            }
            let leaf_bytes = bits::align_up(LEAF_BYTES, P::PAGE_SIZE);
            let leaf = pal.reserve(leaf_bytes).ok_or(Error::OutOfMemory { size: leaf_bytes })?;
            // SAFETY: the range was just reserved.
            if let Err(err) = unsafe { pal.notify_using(leaf, leaf_bytes) } {
                // SAFETY: the reservation is unused.
                unsafe { pal.release(leaf, leaf_bytes) };
                return Err(err);
            }
            // Fresh reservations read as zero, which is an unowned entry.
            let leaf_ptr = leaf.cast::<Leaf>().as_ptr();
            if slot.compare_exchange(ptr::null_mut(), leaf_ptr, AcqRel, Acquire).is_err() {
                // SAFETY: another thread published its leaf first.
                unsafe { pal.release(leaf, leaf_bytes) };
            }
        }
        Ok(())
    }

    /// Sets the entry of the chunk containing `addr`.
    ///
    /// The range must have been registered.
    #[inline]
    pub fn set(&self, addr: usize, entry: MetaEntry) {
        match self.entry(addr) {
            Some(slot) => slot.store(entry),
            None => debug_assert!(false, "setting an unregistered pagemap entry {addr:#x}"),
        }
    }

    /// Sets the entries of every chunk of `[base, base + size)`.
    pub fn set_range(&self, base: usize, size: usize, entry: MetaEntry) {
        let mut addr = base;
        while addr < base + size {
            self.set(addr, entry);
            addr += MIN_CHUNK_SIZE;
        }
    }

    /// Marks `addr` as the start of a reservation, so that the backend never
    /// merges a block ending right before it with one starting at it.
    pub fn set_boundary(&self, addr: usize) {
        if let Some(slot) = self.entry(addr) {
            slot.set_boundary();
        }
    }

    /// The private words of a backend-owned chunk.
    pub fn backend_words(&self, addr: usize) -> Option<(&AtomicUsize, &AtomicUsize)> {
        self.entry(addr).map(Entry::backend_words)
    }
}

#[cfg(all(test, feature = "libc"))]
mod tests {
    use super::*;
    use crate::{pal::UnixPal, sizeclass::REMOTE_MIN_ALIGN};

    #[test]
    fn lookups_and_states() {
        let pal = UnixPal::new(false);
        let pagemap = Pagemap::new();
        assert_eq!(pagemap.get(0x1234_5678), MetaEntry::UNOWNED);
        pagemap.init(&pal, Mitigations::RANDOM_PAGEMAP).unwrap();

        let base = 0x7f00_0000_0000usize & bits::mask_bits(ADDRESS_BITS);
        let size = 4 * MIN_CHUNK_SIZE;
        pagemap.register_range(&pal, base, size).unwrap();
        assert!(pagemap.get(base).is_unowned());
        // Addresses outside the address space are never owned.
        assert!(pagemap.get(usize::MAX).is_unowned());

        pagemap.set_boundary(base);
        let remote = 3 * REMOTE_MIN_ALIGN;
        let sc = SizeClass::from_small(5);
        pagemap.set_range(base, size, MetaEntry::new(None, remote, sc));
        let entry = pagemap.get(base + size - 1);
        assert_eq!((entry.remote(), entry.sizeclass()), (remote, sc));
        assert!(!entry.is_backend_owned());
        assert!(pagemap.get(base).is_boundary());
        assert!(!pagemap.get(base + MIN_CHUNK_SIZE).is_boundary());

        let slot = pagemap.entry(base).unwrap();
        slot.claim_for_backend();
        assert!(pagemap.get(base).is_backend_owned());
        assert!(pagemap.get(base).is_boundary());
        slot.store(MetaEntry::UNOWNED);
        assert!(pagemap.get(base).is_unowned());
        assert!(pagemap.get(base).is_boundary());
    }
}
