use core::{
    cell::Cell,
    ptr::NonNull,
    sync::atomic::AtomicUsize,
};

use super::{
    freelist::{Builder, FreePtr, Iter},
    list::{SlabLink, SlabLinked},
};
use crate::{
    config::Mitigations,
    entropy::{FreeListKey, LocalEntropy},
    error::Corruption,
    sizeclass::{self, SizeClass},
};

/// The bookkeeping of one slab, or of one large allocation.
///
/// Lives in metadata memory obtained from the backend, never inside the slab
/// it describes. The owning [`Heap`](crate::heap::Heap) is the only one
/// touching it, which is why plain cells suffice.
///
/// # State machine
///
/// A small slab is either *active*, sitting in its heap's available list
/// with enough free objects to be worth allocating from, or *sleeping*,
/// waiting for `needed` more frees before it wakes up. In both states
/// `needed` counts down on every free; reaching zero is the transition.
/// Large slabs hold one object and leave on their single free.
pub struct SlabMetadata<'a> {
    link: SlabLink<'a, SlabMetadata<'a>>,
    free_queue: Builder,
    needed: Cell<u16>,
    sleeping: Cell<bool>,
    large: Cell<bool>,
    sizeclass: Cell<SizeClass>,
    chunk: Cell<usize>,
    slab_size: Cell<usize>,
    client: Cell<(Option<NonNull<AtomicUsize>>, usize)>,
}

impl PartialEq for SlabMetadata<'_> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl<'a> SlabLinked<'a> for SlabMetadata<'a> {
    fn link(&'a self) -> &'a SlabLink<'a, Self> {
        &self.link
    }
}

impl core::fmt::Debug for SlabMetadata<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlabMetadata")
            .field("chunk", &format_args!("{:#x}", self.chunk.get()))
            .field("sizeclass", &self.sizeclass.get())
            .field("needed", &self.needed.get())
            .field("sleeping", &self.sleeping.get())
            .field("large", &self.large.get())
            .finish()
    }
}

impl<'a> SlabMetadata<'a> {
    /// The size of the metadata block of a slab with `client_words` words of
    /// client metadata.
    pub const fn alloc_size(client_words: usize) -> usize {
        size_of::<Self>() + client_words * size_of::<usize>()
    }

    /// The number of client metadata words for slabs of `sc`.
    pub fn client_words(sc: SizeClass) -> usize {
        if sc.is_small() {
            sizeclass::sizeclass_to_slab_object_count(sc.as_small()) as usize
        } else {
            1
        }
    }

    /// Constructs the metadata in place.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for [`alloc_size(client_words)`](Self::alloc_size)
    /// bytes, aligned for `Self`, and live for `'a`.
    pub unsafe fn new_in(ptr: NonNull<u8>, client_words: usize) -> &'a Self {
        let meta = ptr.cast::<Self>();
        // SAFETY: see the contract; the client words follow the header.
        unsafe {
            let client = NonNull::new(meta.add(1).cast::<AtomicUsize>().as_ptr());
            for i in 0..client_words {
                if let Some(c) = client {
                    c.add(i).write(AtomicUsize::new(0));
                }
            }
            meta.write(SlabMetadata {
                link: SlabLink::new(),
                free_queue: Builder::new(),
                needed: Cell::new(0),
                sleeping: Cell::new(false),
                large: Cell::new(false),
                sizeclass: Cell::new(SizeClass::UNOWNED),
                chunk: Cell::new(0),
                slab_size: Cell::new(0),
                client: Cell::new((client, client_words)),
            });
            meta.as_ref()
        }
    }

    /// Prepares a fresh small slab. It starts sleeping: no object of it has
    /// been handed out yet, and the free list is built by the caller.
    pub fn initialise(&self, sc: usize, chunk: usize, mitigations: Mitigations) {
        self.free_queue.init(mitigations.contains(Mitigations::RANDOM_PRESERVE));
        self.sizeclass.set(SizeClass::from_small(sc));
        self.chunk.set(chunk);
        self.slab_size.set(sizeclass::sizeclass_to_slab_size(sc));
        self.large.set(false);
        self.set_sleeping(sc, 0, mitigations);
    }

    /// Prepares the metadata of a large allocation.
    pub fn initialise_large(&self, sc: SizeClass, chunk: usize) {
        self.free_queue.init(false);
        self.sizeclass.set(sc);
        self.chunk.set(chunk);
        self.slab_size.set(sizeclass::sizeclass_full_to_slab_size(sc));
        self.large.set(true);
        self.sleeping.set(true);
        self.needed.set(1);
    }

    #[inline]
    pub fn needed(&self) -> u16 {
        self.needed.get()
    }

    #[inline]
    pub fn set_needed(&self, needed: u16) {
        self.needed.set(needed)
    }

    /// Accounts for one freed object, returning whether a transition fired.
    #[inline]
    pub fn return_object(&self) -> bool {
        let needed = self.needed.get() - 1;
        self.needed.set(needed);
        needed == 0
    }

    /// Accounts for up to `*batch` freed objects at once.
    ///
    /// Returns `true` when a transition fired, leaving the objects it did not
    /// account for in `batch`; the caller handles the transition and calls
    /// again until `batch` reaches zero.
    #[inline]
    pub fn return_objects(&self, batch: &mut u16) -> bool {
        let needed = self.needed.get();
        if *batch < needed {
            self.needed.set(needed - *batch);
            *batch = 0;
            false
        } else {
            *batch -= needed;
            self.needed.set(0);
            true
        }
    }

    /// Marks the slab sleeping, unless `remaining` objects already free
    /// reach the wake threshold. Returns whether the slab sleeps.
    pub fn set_sleeping(&self, sc: usize, remaining: u16, mitigations: Mitigations) -> bool {
        let threshold = sizeclass::threshold_for_waking(sc, mitigations);
        if remaining >= threshold {
            let capacity = sizeclass::sizeclass_to_slab_object_count(sc);
            self.needed.set(capacity - remaining);
            self.sleeping.set(false);
            return false;
        }
        self.sleeping.set(true);
        self.needed.set(threshold - remaining);
        true
    }

    /// Wakes the slab: its threshold of objects has been freed, so the rest
    /// are out until it becomes unused.
    pub fn set_not_sleeping(&self, sc: usize, mitigations: Mitigations) {
        let capacity = sizeclass::sizeclass_to_slab_object_count(sc);
        let threshold = sizeclass::threshold_for_waking(sc, mitigations);
        self.needed.set(capacity - threshold);
        self.sleeping.set(false);
    }

    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping.get()
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.large.get()
    }

    /// Whether every object of an active slab is back in its free list.
    #[inline]
    pub fn is_unused(&self) -> bool {
        !self.sleeping.get() && self.needed.get() == 0
    }

    #[inline]
    pub fn sizeclass(&self) -> SizeClass {
        self.sizeclass.get()
    }

    /// The base address of the slab.
    #[inline]
    pub fn chunk(&self) -> usize {
        self.chunk.get()
    }

    #[inline]
    pub fn slab_size(&self) -> usize {
        self.slab_size.get()
    }

    /// Whether `addr` lies inside this slab, the domain every decoded free
    /// list pointer must stay within.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.chunk.get()) < self.slab_size.get()
    }

    /// The free list tweak of this slab, unique among live slabs.
    #[inline]
    pub fn as_key_tweak(&self) -> usize {
        Self::key_tweak_at((self as *const Self).addr())
    }

    /// The tweak of the slab whose metadata lives at `meta_addr`, computed
    /// without reading the metadata, which other threads must not do.
    #[inline]
    pub const fn key_tweak_at(meta_addr: usize) -> usize {
        meta_addr / align_of::<Self>()
    }

    pub fn with_queue<R>(&self, f: impl FnOnce(&Builder) -> R) -> R {
        f(&self.free_queue)
    }

    /// Adds a freed object to the slab's free list.
    #[inline]
    pub fn push_free(&self, obj: FreePtr, key: &FreeListKey, entropy: &mut LocalEntropy) {
        self.free_queue.add(obj, key, self.as_key_tweak(), entropy)
    }

    /// The client metadata word of the `index`th object.
    pub fn client_meta(&self, index: usize) -> Option<&AtomicUsize> {
        let (base, len) = self.client.get();
        // SAFETY: the words were initialized in `new_in` and live as long as
        // the metadata.
        base.filter(|_| index < len).map(|base| unsafe { base.add(index).as_ref() })
    }

    /// Hands out the slab's free list: the first object, the rest of the
    /// list, and whether the slab stays active afterwards.
    pub fn alloc_free_list(
        &self,
        key: &FreeListKey,
        entropy: &mut LocalEntropy,
        mitigations: Mitigations,
    ) -> Result<(FreePtr, Iter, bool), Corruption> {
        let tweak = self.as_key_tweak();
        let (mut iter, remaining) = self.free_queue.close(key, tweak);
        let first = iter.take(key, |addr| self.contains(addr))?.ok_or(Corruption::FreeList)?;
        if mitigations.contains(Mitigations::RANDOM_PRESERVE) {
            entropy.refresh_bits();
        }
        let sleeping = self.set_sleeping(self.sizeclass.get().as_small(), remaining, mitigations);
        Ok((first, iter, !sleeping))
    }

    /// Checks the slab's free list, for teardown and the fuzzers.
    pub fn validate(&self, key: &FreeListKey) -> Result<(), Corruption> {
        self.free_queue.validate(key, self.as_key_tweak(), |addr| self.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use core::{ptr::NonNull, sync::atomic::Ordering::Relaxed};
    use std::{boxed::Box, vec, vec::Vec};

    use super::*;

    fn meta<'a>(client_words: usize) -> &'a SlabMetadata<'a> {
        let words = SlabMetadata::alloc_size(client_words).div_ceil(size_of::<usize>());
        let mem: &'static mut [usize] = Box::leak(vec![0usize; words].into_boxed_slice());
        unsafe { SlabMetadata::new_in(NonNull::from(mem).cast(), client_words) }
    }

    #[test]
    fn needed_counts_to_unused() {
        let sc = 3;
        let m = Mitigations::NONE;
        let capacity = sizeclass::sizeclass_to_slab_object_count(sc);
        let threshold = sizeclass::threshold_for_waking(sc, m);
        let meta = meta(capacity as usize);
        meta.initialise(sc, 0x10000, m);
        assert!(meta.is_sleeping());
        assert_eq!(meta.needed(), threshold);

        // Everything handed out: the slab sleeps until `threshold` frees.
        assert!(meta.set_sleeping(sc, 0, m));
        for _ in 1..threshold {
            assert!(!meta.return_object());
        }
        assert!(meta.return_object());
        meta.set_not_sleeping(sc, m);
        assert!(!meta.is_sleeping());

        // The rest comes back, and the slab is unused exactly at the end.
        let mut batch = capacity - threshold - 1;
        assert!(!meta.return_objects(&mut batch));
        assert_eq!(batch, 0);
        assert!(!meta.is_unused());
        assert!(meta.return_object());
        assert!(meta.is_unused());
    }

    #[test]
    fn batches_split_at_transitions() {
        let sc = 0;
        let m = Mitigations::NONE;
        let meta = meta(0);
        meta.initialise(sc, 0x10000, m);
        let threshold = meta.needed();
        let mut batch = threshold + 2;
        assert!(meta.return_objects(&mut batch));
        assert_eq!(batch, 2);
        assert_eq!(meta.needed(), 0);
    }

    #[test]
    fn large_and_client_meta() {
        let meta = meta(1);
        meta.initialise_large(SizeClass::from_large_bits(20), 1 << 20);
        assert!(meta.is_large());
        assert_eq!(meta.slab_size(), 1 << 20);
        assert!(meta.contains((1 << 20) + 5));
        assert!(!meta.contains(1 << 21));

        assert_eq!(meta.client_meta(0).unwrap().load(Relaxed), 0);
        meta.client_meta(0).unwrap().store(42, Relaxed);
        assert!(meta.client_meta(1).is_none());
        assert!(meta.return_object());
    }

    #[test]
    fn hands_out_built_list() {
        let sc = 0;
        let size = sizeclass::sizeclass_to_size(sc);
        let mut slab: Vec<u8> = vec![0; sizeclass::sizeclass_to_slab_size(sc) * 2];
        let base = slab.as_mut_ptr().addr().next_multiple_of(sizeclass::sizeclass_to_slab_size(sc));
        let m = Mitigations::FREELIST_FORWARD_EDGE.union(Mitigations::FREELIST_BACKWARD_EDGE);
        let key = FreeListKey::fixed(m);
        let mut entropy = LocalEntropy::with_seed(1, 2);

        let meta = meta(0);
        meta.initialise(sc, base, m);
        let offset = base - slab.as_mut_ptr().addr();
        for i in 0..4 {
            let ptr = NonNull::new(slab[offset + i * size..].as_mut_ptr()).unwrap();
            meta.push_free(unsafe { crate::slab::FreeObject::make(ptr) }, &key, &mut entropy);
        }
        meta.validate(&key).unwrap();

        let (first, mut rest, active) = meta.alloc_free_list(&key, &mut entropy, m).unwrap();
        assert_eq!(first.addr(), base);
        assert!(!active);
        let mut count = 1;
        while rest.take(&key, |a| meta.contains(a)).unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
    }
}
