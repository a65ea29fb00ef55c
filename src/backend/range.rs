//! The range pipeline.
//!
//! A range hands out and takes back power-of-two blocks of address space.
//! Stages wrap their parent, leaf to root: the OS source, the pagemap
//! registration, buddy caches and decorators for commit, statistics,
//! logging and locking. Every stage declares whether the blocks it hands
//! out are aligned to their size and whether it may be shared by threads;
//! composing stages checks both at compile time.

mod buddy;
mod commit;
mod lock;
mod log;
mod pal;
mod register;
mod source;
mod stats;

use core::ptr::NonNull;

pub use self::{
    buddy::{LargeBuddy, SmallBuddy},
    commit::CommitRange,
    lock::LockRange,
    log::LogRange,
    pal::PalRange,
    register::PagemapRegister,
    source::{GlobalSource, MetaSource},
    stats::StatsRange,
};
use super::Context;
use crate::pal::Pal;

/// One stage of the pipeline.
///
/// Exhaustion is not an error here: a stage that cannot satisfy a request
/// returns `None` and the caller decides.
pub trait Range {
    /// Whether every block of size `s` is aligned to `s`.
    const ALIGNED: bool;
    /// Whether the stage may be called from several threads at once.
    const CONCURRENCY_SAFE: bool;

    fn alloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `base` and `size` must describe a block handed out by this stage, no
    /// longer in use.
    unsafe fn dealloc_range<P: Pal>(&mut self, cx: &Context<'_, P>, base: NonNull<u8>, size: usize);
}

/// Builder methods composing stages on top of a range.
pub trait RangeExt: Range + Sized {
    fn register(self) -> PagemapRegister<Self> {
        PagemapRegister::new(self)
    }

    fn large_buddy(self, refill_bits: usize, max_bits: usize) -> LargeBuddy<Self> {
        LargeBuddy::new(self, refill_bits, max_bits)
    }

    fn small_buddy(self) -> SmallBuddy<Self> {
        SmallBuddy::new(self)
    }

    fn commit(self) -> CommitRange<Self> {
        CommitRange::new(self)
    }

    fn stats(self) -> StatsRange<Self> {
        StatsRange::new(self)
    }

    fn log(self, name: &'static str) -> LogRange<Self> {
        LogRange::new(self, name)
    }

    fn lock(self) -> LockRange<Self> {
        LockRange::new(self)
    }
}

impl<R: Range> RangeExt for R {}
