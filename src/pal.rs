//! The platform abstraction layer.
//!
//! See [`Pal`] for the contract the rest of the allocator relies on.

#[cfg(feature = "libc")]
mod unix;

use core::{fmt, ptr::NonNull, sync::atomic::AtomicU32};

#[cfg(feature = "libc")]
pub use self::unix::UnixPal;
use crate::error::Error;

/// Blocking on a memory word.
///
/// Both wake functions take raw pointers: the waiter may observe its wake-up
/// and release the word's storage before the waker's call returns.
pub trait Wait {
    /// Blocks while `*word == expected`. May return spuriously.
    fn wait(&self, word: &AtomicU32, expected: u32);

    /// # Safety
    ///
    /// `word` must have been a valid `AtomicU32` when the waiter went to sleep.
    unsafe fn wake_one(&self, word: *const AtomicU32);

    /// # Safety
    ///
    /// See [`Wait::wake_one`].
    unsafe fn wake_all(&self, word: *const AtomicU32);
}

/// The memory and process primitives of an operating system.
///
/// Address space moves through three states: reserved (`reserve`), in use
/// (`notify_using`) and reserved again (`notify_not_using`). Reserved memory
/// is never returned to the OS.
pub trait Pal: Wait + Sync {
    const PAGE_SIZE: usize;

    /// Reserves `size` bytes of address space, aligned to the page size.
    fn reserve(&self, size: usize) -> Option<NonNull<u8>>;

    /// Reserves `size` bytes of address space aligned to `size`, which must
    /// be a power of two no smaller than the page size.
    fn reserve_aligned(&self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a whole reservation to the OS.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe exactly one prior reservation, no longer
    /// in use.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);

    /// Makes the range accessible.
    ///
    /// # Safety
    ///
    /// The range must have been reserved through this platform and be
    /// page-aligned.
    unsafe fn notify_using(&self, ptr: NonNull<u8>, size: usize) -> Result<(), Error>;

    /// Tells the OS the content of the range is no longer needed.
    ///
    /// # Safety
    ///
    /// The range must have been reserved through this platform, page-aligned,
    /// and no longer accessed.
    unsafe fn notify_not_using(&self, ptr: NonNull<u8>, size: usize);

    /// Zeroes an in-use range.
    ///
    /// # Safety
    ///
    /// The range must be in use and writable.
    unsafe fn zero(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { ptr.write_bytes(0, size) }
    }

    /// A 64-bit value from the OS entropy source.
    fn entropy64(&self) -> u64;

    /// Writes a diagnostic line to the process's error output.
    fn message(&self, msg: &str);

    /// Reports `msg` and terminates the process.
    fn error(&self, msg: &str) -> !;
}

/// A fixed-capacity, truncating formatter for diagnostics.
///
/// Fatal paths must not allocate, so messages are rendered into a stack
/// buffer.
pub(crate) struct MessageBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> MessageBuf<N> {
    pub(crate) const fn new() -> Self {
        MessageBuf { buf: [0; N], len: 0 }
    }

    pub(crate) fn as_str(&self) -> &str {
        match core::str::from_utf8(&self.buf[..self.len]) {
            Ok(s) => s,
            // Truncation may split a code point; keep the valid prefix.
            Err(e) => core::str::from_utf8(&self.buf[..e.valid_up_to()]).unwrap_or(""),
        }
    }
}

impl<const N: usize> fmt::Write for MessageBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(N - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Renders `args` without allocating and passes it to [`Pal::message`].
pub fn message<P: Pal + ?Sized>(pal: &P, args: fmt::Arguments<'_>) {
    let mut buf = MessageBuf::<512>::new();
    let _ = fmt::write(&mut buf, args);
    pal.message(buf.as_str())
}

/// Renders `args` without allocating and passes it to [`Pal::error`].
#[cold]
pub fn error<P: Pal + ?Sized>(pal: &P, args: fmt::Arguments<'_>) -> ! {
    let mut buf = MessageBuf::<512>::new();
    let _ = fmt::write(&mut buf, args);
    pal.error(buf.as_str())
}

/// Terminates the process on a fatal `err`.
#[cold]
pub fn fatal<P: Pal + ?Sized>(pal: &P, err: Error) -> ! {
    log_at!(error, "fatal: {err}");
    error(pal, format_args!("postalloc: {err}"))
}

#[cfg(test)]
mod tests {
    use core::fmt::Write;

    use super::MessageBuf;

    #[test]
    fn message_buf_truncates() {
        let mut buf = MessageBuf::<8>::new();
        write!(buf, "{}", "0123456789").unwrap();
        assert_eq!(buf.as_str(), "01234567");

        let mut buf = MessageBuf::<5>::new();
        write!(buf, "ab{}", 'é').unwrap();
        write!(buf, "é").unwrap();
        assert_eq!(buf.as_str(), "abé");
    }
}
