use core::ptr::NonNull;

use super::Range;
use crate::{backend::Context, pal::Pal};

/// Registers every block coming from the parent in the pagemap, marking its
/// start as a reservation boundary.
#[derive(Debug, Default)]
pub struct PagemapRegister<R> {
    parent: R,
}

impl<R: Range> PagemapRegister<R> {
    pub const fn new(parent: R) -> Self {
        PagemapRegister { parent }
    }
}

impl<R: Range> Range for PagemapRegister<R> {
    const ALIGNED: bool = R::ALIGNED;
    const CONCURRENCY_SAFE: bool = R::CONCURRENCY_SAFE;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        let base = self.parent.alloc_range(cx, size)?;
        if let Err(err) = cx.pagemap.register_range(cx.pal, base.addr().get(), size) {
            log_at!(warn, "cannot register {base:p}+{size:#x} in the pagemap: {err}");
            // SAFETY: the block was just handed out and is unused.
            unsafe { self.parent.dealloc_range(cx, base, size) };
            return None;
        }
        cx.pagemap.set_boundary(base.addr().get());
        Some(base)
    }

    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        // SAFETY: forwarded contract.
        unsafe { self.parent.dealloc_range(cx, base, size) }
    }
}
