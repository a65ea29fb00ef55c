use core::sync::atomic::{AtomicUsize, Ordering::*};

/// Live usage counters, shared by every heap of one [`Globals`].
///
/// [`Globals`]: crate::globals::Globals
#[derive(Debug, Default)]
pub struct Stats {
    current: AtomicUsize,
    peak: AtomicUsize,
    reserved: AtomicUsize,
    heaps: AtomicUsize,
}

impl Stats {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: Stats = Stats {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        reserved: AtomicUsize::new(0),
        heaps: AtomicUsize::new(0),
    };

    /// Accounts for `size` bytes leaving the backend for a heap.
    pub fn add_committed(&self, size: usize) {
        let current = self.current.fetch_add(size, Relaxed) + size;
        self.peak.fetch_max(current, Relaxed);
    }

    pub fn sub_committed(&self, size: usize) {
        self.current.fetch_sub(size, Relaxed);
    }

    pub fn add_reserved(&self, size: usize) {
        self.reserved.fetch_add(size, Relaxed);
    }

    pub fn add_heap(&self) {
        self.heaps.fetch_add(1, Relaxed);
    }

    pub fn snapshot(&self) -> Stat {
        Stat {
            current: self.current.load(Relaxed),
            peak: self.peak.load(Relaxed),
            reserved: self.reserved.load(Relaxed),
            heaps: self.heaps.load(Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stat {
    /// Bytes currently handed out by the global address-space ranges.
    pub current: usize,
    /// The maximum of `current` so far.
    pub peak: usize,
    /// Bytes of address space reserved from the OS.
    pub reserved: usize,
    /// Heaps ever created.
    pub heaps: usize,
}

impl Default for Stat {
    fn default() -> Self {
        Self::INIT
    }
}

impl Stat {
    pub const INIT: Stat = Stat { current: 0, peak: 0, reserved: 0, heaps: 0 };

    pub fn assert_clean(&self, baseline: &Stat) {
        assert_eq!(
            self.current,
            baseline.current,
            "{} byte(s) are probably leaked",
            self.current.wrapping_sub(baseline.current)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_follows_current() {
        let stats = Stats::default();
        stats.add_committed(100);
        stats.add_committed(50);
        stats.sub_committed(120);
        stats.add_reserved(1 << 20);
        stats.add_heap();
        let stat = stats.snapshot();
        assert_eq!(stat, Stat { current: 30, peak: 150, reserved: 1 << 20, heaps: 1 });
        stat.assert_clean(&Stat { current: 30, ..Stat::INIT });
    }
}
