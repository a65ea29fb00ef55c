use core::ptr::{self, NonNull};

use super::Range;
use crate::{
    backend::{
        Context,
        buddy::Buddy,
        tree::{INLINE_MIN_SIZE, InlineRep, PagemapRep},
    },
    bits,
    config::MIN_CHUNK_BITS,
    pal::Pal,
    sizeclass::MIN_CHUNK_SIZE,
};

fn addr_to_ptr(addr: usize) -> Option<NonNull<u8>> {
    NonNull::new(ptr::with_exposed_provenance_mut(addr))
}

/// Splits `[base, base + len)` into naturally aligned power-of-two blocks.
fn for_each_block(mut base: usize, mut len: usize, mut f: impl FnMut(usize, usize)) {
    while len > 0 {
        let align = bits::one_at_bit(bits::ctz(base));
        let size = align.min(bits::prev_pow2(len));
        f(base, size);
        base += size;
        len -= size;
    }
}

/// A cache of chunk-sized and larger blocks, with its free lists kept in the
/// pagemap.
///
/// Requests of `2^max_bits` bytes or more bypass the cache. A miss refills
/// from the parent with a block that grows with the total requested so far,
/// up to `2^refill_bits`.
#[derive(Debug)]
pub struct LargeBuddy<R> {
    parent: R,
    buddy: Buddy,
    refill_bits: usize,
    requested: usize,
}

impl<R: Range> LargeBuddy<R> {
    pub const fn new(parent: R, refill_bits: usize, max_bits: usize) -> Self {
        const { assert!(R::ALIGNED, "a buddy needs aligned blocks from its parent") };
        assert!(refill_bits <= max_bits);
        LargeBuddy {
            parent,
            buddy: Buddy::new(MIN_CHUNK_BITS, max_bits),
            refill_bits,
            requested: 0,
        }
    }

    fn add_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: usize, len: usize) {
        let rep = PagemapRep::new(cx.pagemap);
        let max = self.buddy.max_size();
        let mut overflow = None;
        for_each_block(base, len, |addr, size| {
            if let Some(block) = self.buddy.add_block(&rep, addr, size) {
                debug_assert!(overflow.is_none());
                overflow = Some(block);
            }
        });
        if let Some(block) = overflow.and_then(addr_to_ptr) {
            // SAFETY: the block is free and was handed out by the parent.
            unsafe { self.parent.dealloc_range(cx, block, max) }
        }
    }

    fn refill<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        let refill = self.requested.min(bits::one_at_bit(self.refill_bits)).max(size);
        let refill = bits::next_pow2(refill);
        let base = self.parent.alloc_range(cx, refill)?;
        self.requested += refill;
        self.add_range(cx, base.addr().get() + size, refill - size);
        Some(base)
    }

    pub fn is_empty(&self) -> bool {
        self.buddy.is_empty()
    }
}

impl<R: Range> Range for LargeBuddy<R> {
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = false;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        let size = size.max(MIN_CHUNK_SIZE);
        if size >= self.buddy.max_size() {
            return self.parent.alloc_range(cx, size);
        }
        let rep = PagemapRep::new(cx.pagemap);
        match self.buddy.remove_block(&rep, size) {
            Some(addr) => addr_to_ptr(addr),
            None => self.refill(cx, size),
        }
    }

    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        let size = size.max(MIN_CHUNK_SIZE);
        if size >= self.buddy.max_size() {
            // SAFETY: forwarded contract.
            return unsafe { self.parent.dealloc_range(cx, base, size) };
        }
        self.add_range(cx, base.addr().get(), size)
    }
}

/// A cache of sub-chunk blocks for metadata, with its free lists kept in
/// the free blocks themselves.
///
/// The memory coming from the parent must be committed.
#[derive(Debug)]
pub struct SmallBuddy<R> {
    parent: R,
    buddy: Buddy,
}

impl<R: Range> SmallBuddy<R> {
    pub const fn new(parent: R) -> Self {
        const { assert!(R::ALIGNED, "a buddy needs aligned blocks from its parent") };
        SmallBuddy {
            parent,
            buddy: Buddy::new(bits::ctz(INLINE_MIN_SIZE), MIN_CHUNK_BITS),
        }
    }

    fn add_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: usize, len: usize) {
        let mut overflow = None;
        for_each_block(base, len, |addr, size| {
            if let Some(block) = self.buddy.add_block(&InlineRep, addr, size) {
                overflow = Some(block);
            }
        });
        if let Some(block) = overflow.and_then(addr_to_ptr) {
            // SAFETY: the whole chunk is free again.
            unsafe { self.parent.dealloc_range(cx, block, MIN_CHUNK_SIZE) }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buddy.is_empty()
    }
}

impl<R: Range> Range for SmallBuddy<R> {
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = false;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>> {
        let size = bits::next_pow2(size.max(INLINE_MIN_SIZE));
        if size >= MIN_CHUNK_SIZE {
            return self.parent.alloc_range(cx, size);
        }
        if let Some(addr) = self.buddy.remove_block(&InlineRep, size) {
            return addr_to_ptr(addr);
        }
        let base = self.parent.alloc_range(cx, MIN_CHUNK_SIZE)?;
        self.add_range(cx, base.addr().get() + size, MIN_CHUNK_SIZE - size);
        Some(base)
    }

    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize) {
        let size = bits::next_pow2(size.max(INLINE_MIN_SIZE));
        if size >= MIN_CHUNK_SIZE {
            // SAFETY: forwarded contract.
            return unsafe { self.parent.dealloc_range(cx, base, size) };
        }
        self.add_range(cx, base.addr().get(), size)
    }
}
