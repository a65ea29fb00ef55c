use core::ptr::NonNull;

use super::Range;
use crate::{backend::Context, pal::Pal};

/// Address space straight from the OS.
///
/// Reservations are never given back: returned blocks are only decommitted.
#[derive(Debug, Default)]
pub struct PalRange;

impl PalRange {
    pub const fn new() -> Self {
        PalRange
    }
}

impl Range for PalRange {
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = true;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        let base = cx.pal.reserve_aligned(size.max(P::PAGE_SIZE))?;
        cx.stats.add_reserved(size);
        Some(base)
    }

    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        // SAFETY: the block was reserved by us and is no longer in use.
        unsafe { cx.pal.notify_not_using(base, size) }
    }
}
