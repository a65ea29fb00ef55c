use core::ptr::NonNull;

use super::Range;
use crate::{backend::Context, pal::Pal, sync::CombiningLock};

/// Serializes access to its parent, so that it can be shared by reference.
#[derive(Debug)]
pub struct LockRange<R> {
    inner: CombiningLock<R>,
}

impl<R: Range> LockRange<R> {
    pub const fn new(parent: R) -> Self {
        LockRange { inner: CombiningLock::new(parent) }
    }

    pub fn alloc_shared<P: Pal>(&self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        self.inner.with(cx.pal, |parent| parent.alloc_range(cx, size))
    }

    /// # Safety
    ///
    /// See [`Range::dealloc_range`].
    pub unsafe fn dealloc_shared<P: Pal>(&self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        // SAFETY: forwarded contract.
        self.inner.with(cx.pal, |parent| unsafe { parent.dealloc_range(cx, base, size) })
    }
}

impl<R: Range> Range for LockRange<R> {
    const ALIGNED: bool = R::ALIGNED;
    const CONCURRENCY_SAFE: bool = true;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        self.alloc_shared(cx, size)
    }

    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        // SAFETY: forwarded contract.
        unsafe { self.dealloc_shared(cx, base, size) }
    }
}
