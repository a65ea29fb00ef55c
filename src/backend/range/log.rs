use core::ptr::NonNull;

use super::Range;
use crate::{backend::Context, pal::Pal};

/// Traces every request under `name`.
#[derive(Debug)]
pub struct LogRange<R> {
    parent: R,
    #[cfg_attr(not(feature = "error-log"), allow(dead_code))]
    name: &'static str,
}

impl<R: Range> LogRange<R> {
    pub const fn new(parent: R, name: &'static str) -> Self {
        LogRange { parent, name }
    }
}

impl<R: Range> Range for LogRange<R> {
    const ALIGNED: bool = R::ALIGNED;
    const CONCURRENCY_SAFE: bool = R::CONCURRENCY_SAFE;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        let ret = self.parent.alloc_range(cx, size);
        match ret {
            Some(base) => log_at!(trace, "{}: alloc {size:#x} -> {base:p}", self.name),
            None => log_at!(debug, "{}: alloc {size:#x} failed", self.name),
        }
        ret
    }

    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        log_at!(trace, "{}: dealloc {base:p}+{size:#x}", self.name);
        // SAFETY: forwarded contract.
        unsafe { self.parent.dealloc_range(cx, base, size) }
    }
}
