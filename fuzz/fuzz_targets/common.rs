use std::{alloc::Layout, ptr::NonNull};

use libfuzzer_sys::arbitrary::Arbitrary;

pub const THREADS: usize = 8;
pub const TRANSFER_COUNT: usize = 1000;

#[derive(Debug, Arbitrary)]
pub enum Action {
    Allocate { size: u32, align_shift: u8, zeroed: bool },
    Deallocate { index: u8 },
    Reallocate { index: u8, size: u32 },
    UsableSize { index: u8 },
    Flush,
    Transfer { from: u8, to: u8 },
}

impl Action {
    /// Clamps a fuzzed request to at most 16 MiB, aligned to at most 256 KiB.
    pub fn layout(size: u32, align_shift: u8) -> Layout {
        let size = (size % (1 << 24)) as usize;
        Layout::from_size_align(size, 1 << (align_shift % 19)).unwrap()
    }
}

/// A live block, stamped at both ends with a tag derived from its address.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub ptr: NonNull<u8>,
    pub layout: Layout,
}

unsafe impl Send for Allocation {}

impl Allocation {
    fn tag(&self) -> u8 {
        (self.ptr.as_ptr().addr() >> 4) as u8 ^ self.layout.size() as u8
    }

    /// Takes over a fresh block, checking its zeroing if requested.
    pub fn new(ptr: NonNull<u8>, layout: Layout, zeroed: bool) -> Self {
        assert_eq!(ptr.as_ptr().addr() % layout.align(), 0, "{ptr:p} misaligned for {layout:?}");
        let this = Allocation { ptr, layout };
        if zeroed {
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), layout.size()) };
            assert!(bytes.iter().all(|&b| b == 0), "{ptr:p} not zeroed");
        }
        this.stamp();
        this
    }

    pub fn stamp(&self) {
        let tag = self.tag();
        if let Some(last) = self.layout.size().checked_sub(1) {
            unsafe {
                self.ptr.write(tag);
                self.ptr.add(last).write(tag);
            }
        }
    }

    pub fn check(&self) {
        let tag = self.tag();
        if let Some(last) = self.layout.size().checked_sub(1) {
            unsafe {
                assert_eq!(self.ptr.read(), tag, "{:p} overwritten at the start", self.ptr);
                assert_eq!(self.ptr.add(last).read(), tag, "{:p} overwritten at the end", self.ptr);
            }
        }
    }

    /// Hands the block over to the caller without freeing it.
    pub fn into_raw(self) -> (NonNull<u8>, Layout) {
        self.check();
        (self.ptr, self.layout)
    }
}
