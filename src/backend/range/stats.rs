use core::ptr::NonNull;

use super::Range;
use crate::{backend::Context, pal::Pal};

/// Counts the bytes passing through into [`Stats`](crate::stat::Stats).
#[derive(Debug, Default)]
pub struct StatsRange<R> {
    parent: R,
}

impl<R: Range> StatsRange<R> {
    pub const fn new(parent: R) -> Self {
        StatsRange { parent }
    }
}

impl<R: Range> Range for StatsRange<R> {
    const ALIGNED: bool = R::ALIGNED;
    const CONCURRENCY_SAFE: bool = R::CONCURRENCY_SAFE;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        let base = self.parent.alloc_range(cx, size)?;
        cx.stats.add_committed(size);
        Some(base)
    }

    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        cx.stats.sub_committed(size);
        // SAFETY: forwarded contract.
        unsafe { self.parent.dealloc_range(cx, base, size) }
    }
}
