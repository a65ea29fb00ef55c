use core::ptr::NonNull;

use super::Range;
use crate::{backend::Context, config::Mitigations, pal::Pal};

/// The process-wide object range, as the root of a heap-local pipeline.
#[derive(Debug, Default)]
pub struct GlobalSource;

impl Range for GlobalSource {
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = true;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        cx.global.alloc_shared(cx, size)
    }

    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        // SAFETY: forwarded contract.
        unsafe { cx.global.dealloc_shared(cx, base, size) }
    }
}

/// The source of metadata memory: a range of its own under
/// `metadata-protection`, the object range otherwise.
#[derive(Debug, Default)]
pub struct MetaSource;

impl MetaSource {
    fn protected<P: Pal>(cx: &Context<'_, P>) -> bool {
        cx.mitigations.contains(Mitigations::METADATA_PROTECTION)
    }
}

impl Range for MetaSource {
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = true;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        if Self::protected(cx) {
            cx.global_meta.alloc_shared(cx, size)
        } else {
            cx.global.alloc_shared(cx, size)
        }
    }

    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        // SAFETY: forwarded contract.
        unsafe {
            if Self::protected(cx) {
                cx.global_meta.dealloc_shared(cx, base, size)
            } else {
                cx.global.dealloc_shared(cx, base, size)
            }
        }
    }
}
