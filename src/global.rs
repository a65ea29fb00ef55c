//! The process-wide allocator.

mod thread;

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{
    config::{DEFAULT_MITIGATIONS, Mitigations},
    error::Error,
    globals::Globals,
    heap::Heap,
    pal::{self, UnixPal},
    sizeclass,
    stat::Stat,
};

type GlobalHeap = Heap<'static, UnixPal>;

static GLOBALS: Globals<'static, UnixPal> = Globals::new(
    UnixPal::new(DEFAULT_MITIGATIONS.contains(Mitigations::PAL_ENFORCE_ACCESS)),
    DEFAULT_MITIGATIONS,
);

/// The process-wide allocator, with one heap per thread.
///
/// All values of this type refer to the same instance, configured with the
/// mitigations selected by the crate's features.
///
/// ```rust,ignore
/// #[global_allocator]
/// static ALLOC: postalloc::PostAlloc = postalloc::PostAlloc;
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PostAlloc;

impl PostAlloc {
    /// The shared state behind this allocator.
    pub fn globals(&self) -> &'static Globals<'static, UnixPal> {
        &GLOBALS
    }

    /// The size of the block [`allocate`](Self::allocate) serves `layout`
    /// with.
    fn block_size(layout: Layout) -> Result<usize, Error> {
        match sizeclass::aligned_size(layout.align(), layout.size().max(1)) {
            usize::MAX => Err(Error::OutOfMemory { size: layout.size() }),
            size => Ok(size),
        }
    }

    fn alloc_with(
        &self,
        layout: Layout,
        f: impl FnOnce(&GlobalHeap, usize) -> Result<NonNull<u8>, Error>,
    ) -> Result<NonNull<u8>, Error> {
        Self::block_size(layout)
            .and_then(|size| thread::with(|heap| f(heap, size)).and_then(|res| res))
            .map_err(report)
    }

    /// Allocates a block fitting `layout`.
    ///
    /// The only error returned is [`Error::OutOfMemory`]; anything else
    /// terminates the process.
    #[inline]
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error> {
        self.alloc_with(layout, |heap, size| heap.alloc(size))
    }

    /// Like [`allocate`](Self::allocate), with the block zeroed.
    pub fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, Error> {
        self.alloc_with(layout, |heap, size| heap.alloc_zeroed(size))
    }

    /// Frees a block returned by this allocator, checking `layout` against
    /// its size class when sanity checks are on.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live block of this allocator, allocated with
    /// `layout`.
    #[inline]
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let size = Self::block_size(layout).unwrap_or(layout.size());
        // SAFETY: see the contract.
        unsafe { self.dealloc_with(|heap| heap.dealloc_sized(ptr.as_ptr(), size)) }
    }

    /// Frees `ptr`, which may be null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block of this allocator.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: see the contract.
        unsafe { self.dealloc_with(|heap| heap.dealloc(ptr)) }
    }

    fn dealloc_with(&self, f: impl FnOnce(&GlobalHeap)) {
        if let Err(err) = thread::with(f) {
            // Without a heap the block cannot be returned anywhere.
            report(err);
        }
    }

    /// Resizes the block at `ptr` to `new_size` bytes, in place if the new
    /// size maps to the same size class.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live block of this allocator, allocated with
    /// `layout`. On success the old block must no longer be used.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Result<NonNull<u8>, Error> {
        let new_layout = Layout::from_size_align(new_size, layout.align())
            .map_err(|_| report(Error::OutOfMemory { size: new_size }))?;
        let usable = self.usable_size(ptr.as_ptr());
        if sizeclass::round_size(Self::block_size(new_layout)?) == usable {
            return Ok(ptr);
        }
        let new = self.allocate(new_layout)?;
        // SAFETY: both blocks are live, distinct, and hold at least the
        // smaller size.
        unsafe {
            new.copy_from_nonoverlapping(ptr, layout.size().min(new_size));
            self.deallocate(ptr, layout);
        }
        Ok(new)
    }

    /// The number of bytes usable from the start of the block at `ptr`, or 0
    /// if this allocator does not own it.
    pub fn usable_size(&self, ptr: *const u8) -> usize {
        GLOBALS.alloc_size(ptr)
    }

    /// Returns everything cached by the current thread's heap: empty slabs go
    /// back to the backend, and frees of other threads' objects are posted.
    pub fn flush(&self) {
        thread::with_existing(|heap| heap.flush());
    }

    pub fn stat(&self) -> Stat {
        GLOBALS.stats()
    }
}

/// Terminates on fatal errors, logging and passing through the rest.
#[cold]
fn report(err: Error) -> Error {
    if err.is_fatal() {
        pal::fatal(GLOBALS.backend().pal(), err)
    }
    log_at!(warn, "{err}");
    err
}

unsafe impl GlobalAlloc for PostAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.allocate_zeroed(layout).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: see the contract of `GlobalAlloc::dealloc`.
            unsafe { self.deallocate(ptr, layout) }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        // SAFETY: see the contract of `GlobalAlloc::realloc`.
        unsafe { self.reallocate(ptr, layout, new_size) }.map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
