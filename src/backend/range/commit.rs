use core::ptr::NonNull;

use super::Range;
use crate::{backend::Context, pal::Pal, track};

/// Commits blocks on their way up and decommits them on their way down.
#[derive(Debug, Default)]
pub struct CommitRange<R> {
    parent: R,
}

impl<R: Range> CommitRange<R> {
    pub const fn new(parent: R) -> Self {
        CommitRange { parent }
    }
}

impl<R: Range> Range for CommitRange<R> {
    const ALIGNED: bool = R::ALIGNED;
    const CONCURRENCY_SAFE: bool = R::CONCURRENCY_SAFE;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        let base = self.parent.alloc_range(cx, size)?;
        // SAFETY: the block comes from the OS through the parent.
        if let Err(err) = unsafe { cx.pal.notify_using(base, size) } {
            log_at!(warn, "cannot commit {base:p}+{size:#x}: {err}");
            // SAFETY: the block was just handed out and is unused.
            unsafe { self.parent.dealloc_range(cx, base, size) };
            return None;
        }
        track::undefined(base, size);
        Some(base)
    }

    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        track::no_access(base, size);
        // SAFETY: forwarded contract.
        unsafe {
            cx.pal.notify_not_using(base, size);
            self.parent.dealloc_range(cx, base, size)
        }
    }
}
