//! Architecture primitives.

use core::ptr::NonNull;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// The number of address bits actually usable for user-space pointers.
#[cfg(target_pointer_width = "64")]
pub const ADDRESS_BITS: usize = 48;
#[cfg(not(target_pointer_width = "64"))]
pub const ADDRESS_BITS: usize = usize::BITS as usize;

pub const CACHELINE_SIZE: usize = 64;

/// Hints the processor that we are in a spin loop.
#[inline]
pub fn pause() {
    core::hint::spin_loop()
}

/// Pulls the cache line containing `ptr` in advance of a load.
#[inline]
pub fn prefetch<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetching never faults, even on invalid addresses.
    unsafe {
        use core::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
        _mm_prefetch::<_MM_HINT_T0>(ptr.cast())
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}

/// A cheap, monotonic-ish cycle counter.
#[inline]
pub fn tick() -> u64 {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: `rdtsc` has no preconditions.
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(target_arch = "aarch64")]
    {
        let value: u64;
        // SAFETY: `cntvct_el0` is readable from EL0.
        unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) value, options(nomem, nostack)) };
        value
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        COUNTER.fetch_add(0x9e37_79b9_7f4a_7c15, Relaxed)
    }
}

/// Narrows the hardware bounds of `ptr` to `size` bytes.
///
/// Plain address architectures carry no bounds in their pointers, so this is
/// the identity there; [`CapPtr`](crate::ptr::CapPtr) still tracks the bound
/// statically.
#[inline]
pub fn capptr_bound<T>(ptr: NonNull<T>, size: usize) -> NonNull<T> {
    let _ = size;
    ptr
}
