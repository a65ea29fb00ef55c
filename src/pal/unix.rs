use core::{
    ffi::c_void,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering::Relaxed},
};

use errno::{errno, set_errno};

use super::{Pal, Wait};
use crate::{bits, error::Error};

/// The POSIX platform, backed by `libc`.
///
/// Reservations are `MAP_NORESERVE` anonymous mappings, so committing is
/// implicit on first touch unless access enforcement is on.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixPal {
    enforce_access: bool,
}

impl UnixPal {
    pub const fn new(enforce_access: bool) -> Self {
        UnixPal { enforce_access }
    }

    fn mmap(&self, addr: *mut c_void, size: usize, fixed: bool) -> Option<NonNull<u8>> {
        let prot = if self.enforce_access && !fixed {
            libc::PROT_NONE
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            flags |= libc::MAP_NORESERVE;
        }
        if fixed {
            flags |= libc::MAP_FIXED;
        }
        // SAFETY: anonymous mappings have no preconditions; a fixed mapping is
        // only requested over address space we own.
        let ptr = unsafe { libc::mmap(addr, size, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr.cast())
    }

    fn write_stderr(&self, parts: &[&[u8]]) {
        for part in parts {
            let mut rest = *part;
            while !rest.is_empty() {
                // SAFETY: `rest` is a valid readable buffer.
                let n = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
                if n <= 0 {
                    if n < 0 && errno().0 == libc::EINTR {
                        continue;
                    }
                    return;
                }
                rest = &rest[n as usize..];
            }
        }
    }
}

impl Wait for UnixPal {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn wait(&self, word: &AtomicU32, expected: u32) {
        if word.load(Relaxed) != expected {
            return;
        }
        // SAFETY: `word` is a valid futex word for the duration of the call.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                ptr::null::<libc::timespec>(),
            )
        };
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn wait(&self, word: &AtomicU32, expected: u32) {
        if word.load(Relaxed) == expected {
            // SAFETY: `sched_yield` has no preconditions.
            unsafe { libc::sched_yield() };
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn wake_one(&self, word: *const AtomicU32) {
        // SAFETY: the kernel only uses the address as a key.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1,
            )
        };
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe fn wake_one(&self, word: *const AtomicU32) {
        let _ = word;
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn wake_all(&self, word: *const AtomicU32) {
        // SAFETY: the kernel only uses the address as a key.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
            )
        };
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe fn wake_all(&self, word: *const AtomicU32) {
        let _ = word;
    }
}

impl Pal for UnixPal {
    #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
    const PAGE_SIZE: usize = 0x4000;
    #[cfg(not(all(target_vendor = "apple", target_arch = "aarch64")))]
    const PAGE_SIZE: usize = 0x1000;

    fn reserve(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.mmap(ptr::null_mut(), size, false);
        if ptr.is_none() {
            log_at!(warn, "mmap of {size:#x} bytes failed: {}", errno());
        }
        ptr
    }

    fn reserve_aligned(&self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(bits::is_pow2(size) && size >= Self::PAGE_SIZE);

        let trial = self.reserve(size)?;
        if bits::is_aligned(trial.addr().get(), size) {
            return Some(trial);
        }
        // SAFETY: `trial` was just mapped with this size.
        unsafe { self.release(trial, size) };

        let over = size.checked_mul(2)?;
        let base = self.reserve(over)?;
        let start = bits::align_up(base.addr().get(), size);
        let head = start - base.addr().get();
        let tail = over - head - size;
        // SAFETY: both trimmed pieces lie within the fresh over-reservation.
        unsafe {
            if head > 0 {
                libc::munmap(base.as_ptr().cast(), head);
            }
            if tail > 0 {
                libc::munmap(base.as_ptr().add(head + size).cast(), tail);
            }
        }
        // SAFETY: `head` is within the original reservation.
        Some(unsafe { base.add(head) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: the caller owns the whole mapping.
        unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
    }

    unsafe fn notify_using(&self, ptr: NonNull<u8>, size: usize) -> Result<(), Error> {
        debug_assert!(bits::is_aligned(ptr.addr().get() | size, Self::PAGE_SIZE));
        if self.enforce_access {
            // SAFETY: the range is reserved by us.
            let ret = unsafe {
                libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_READ | libc::PROT_WRITE)
            };
            if ret != 0 {
                log_at!(error, "mprotect({ptr:p}, {size:#x}) failed: {}", errno());
                return Err(Error::Platform("cannot commit reserved memory"));
            }
        }
        Ok(())
    }

    unsafe fn notify_not_using(&self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(bits::is_aligned(ptr.addr().get() | size, Self::PAGE_SIZE));
        // SAFETY: the range is reserved by us and the caller no longer uses it.
        unsafe {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED);
            if self.enforce_access {
                #[cfg(debug_assertions)]
                if !cfg!(any(target_os = "linux", target_os = "android")) {
                    ptr.write_bytes(0x5a, size);
                }
                libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_NONE);
            }
        }
    }

    unsafe fn zero(&self, ptr: NonNull<u8>, size: usize) {
        if bits::is_aligned(ptr.addr().get() | size, Self::PAGE_SIZE) {
            // Remapping leaves errno set on failure; the fallback is correct
            // anyway, so hide it from the caller.
            let saved = errno();
            let remapped = self.mmap(ptr.as_ptr().cast(), size, true);
            set_errno(saved);
            if remapped.is_some() {
                return;
            }
        }
        // SAFETY: the caller guarantees the range is writable.
        unsafe { ptr.write_bytes(0, size) }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn entropy64(&self) -> u64 {
        let mut value = 0u64;
        loop {
            // SAFETY: `value` is a valid 8-byte buffer.
            let n = unsafe { libc::getrandom((&raw mut value).cast(), 8, 0) };
            match n {
                8 => return value,
                _ if n < 0 && errno().0 == libc::EINTR => continue,
                _ => super::fatal(self, Error::Platform("failed to get system randomness")),
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn entropy64(&self) -> u64 {
        let mut value = 0u64;
        // SAFETY: `value` is a valid 8-byte buffer.
        if unsafe { libc::getentropy((&raw mut value).cast(), 8) } != 0 {
            super::fatal(self, Error::Platform("failed to get system randomness"));
        }
        value
    }

    fn message(&self, msg: &str) {
        self.write_stderr(&[msg.as_bytes(), b"\n"])
    }

    fn error(&self, msg: &str) -> ! {
        self.write_stderr(&[b"\n", msg.as_bytes(), b"\n"]);
        // SAFETY: `fsync` and `abort` have no preconditions.
        unsafe {
            libc::fsync(libc::STDERR_FILENO);
            libc::abort()
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering::Relaxed};

    use super::*;

    #[test]
    fn reserve_aligned() {
        let pal = UnixPal::new(false);
        for bits in [16, 20, 24] {
            let size = 1usize << bits;
            let ptr = pal.reserve_aligned(size).unwrap();
            assert!(bits::is_aligned(ptr.addr().get(), size));
            unsafe {
                pal.notify_using(ptr, size).unwrap();
                ptr.write_bytes(0xab, size);
                pal.zero(ptr, size);
                assert_eq!(*ptr.as_ptr().add(size - 1), 0);
                pal.notify_not_using(ptr, size);
                pal.release(ptr, size);
            }
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn enforced_access_commits() {
        let pal = UnixPal::new(true);
        let size = UnixPal::PAGE_SIZE * 4;
        let ptr = pal.reserve(size).unwrap();
        unsafe {
            pal.notify_using(ptr, size).unwrap();
            ptr.write(1);
            pal.notify_not_using(ptr, size);
            pal.notify_using(ptr, size).unwrap();
            assert_eq!(ptr.read(), 0);
            pal.release(ptr, size);
        }
    }

    #[test]
    fn entropy_varies() {
        let pal = UnixPal::new(false);
        let a = pal.entropy64();
        let b = pal.entropy64();
        let c = pal.entropy64();
        assert!(a != b || b != c);
    }

    #[test]
    fn wait_returns_on_mismatch() {
        let pal = UnixPal::new(false);
        let word = AtomicU32::new(1);
        pal.wait(&word, 0);
        unsafe { pal.wake_all(&word) };
        assert_eq!(word.load(Relaxed), 1);
    }
}
