//! Fork safety.
//!
//! A process fork copies only the forking thread. If another thread was in
//! the middle of updating shared allocator state, the child inherits that
//! state half-written. Critical sections therefore hold a [`PreventFork`]
//! guard, and the pre-fork handler waits until no thread holds one.
//!
//! Guards nest: only a thread's outermost guard is counted, so a thread
//! already inside a guarded region never waits for a pending fork.

use core::sync::atomic::{AtomicUsize, Ordering::*};

use crate::aal;

const FORKING: usize = 1 << (usize::BITS - 1);

/// The number of threads holding guards, with the top bit set while a fork
/// is pending.
static STATE: AtomicUsize = AtomicUsize::new(0);

#[cfg(any(test, feature = "global"))]
std::thread_local! {
    static DEPTH: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
}

/// Adjusts this thread's nesting depth, returning the previous one.
#[cfg(any(test, feature = "global"))]
fn swap_depth(delta: isize) -> usize {
    DEPTH.with(|depth| {
        let old = depth.get();
        depth.set(old.wrapping_add_signed(delta));
        old
    })
}

/// Without thread-locals every guard counts as outermost. No fork handlers
/// exist in that configuration, so no guard ever waits.
#[cfg(not(any(test, feature = "global")))]
fn swap_depth(_: isize) -> usize {
    0
}

/// A scope during which the process must not fork.
#[must_use = "the guard prevents forking only while alive"]
pub struct PreventFork(());

impl PreventFork {
    pub fn new() -> Self {
        if swap_depth(1) > 0 {
            return PreventFork(());
        }
        let mut state = STATE.load(Relaxed);
        loop {
            if state & FORKING != 0 {
                aal::pause();
                state = STATE.load(Relaxed);
                continue;
            }
            match STATE.compare_exchange_weak(state, state + 1, Acquire, Relaxed) {
                Ok(_) => return PreventFork(()),
                Err(s) => state = s,
            }
        }
    }

    /// Whether some thread is currently inside a guarded region.
    pub fn is_held() -> bool {
        STATE.load(Relaxed) & !FORKING != 0
    }
}

impl Default for PreventFork {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreventFork {
    fn drop(&mut self) {
        if swap_depth(-1) == 1 {
            STATE.fetch_sub(1, Release);
        }
    }
}

/// Blocks new guards and waits for the live ones to be dropped.
#[cfg(any(test, feature = "global"))]
pub fn prefork() {
    // Another thread may be forking concurrently; take turns.
    while STATE.fetch_or(FORKING, Acquire) & FORKING != 0 {
        while STATE.load(Relaxed) & FORKING != 0 {
            aal::pause();
        }
    }
    while STATE.load(Acquire) != FORKING {
        aal::pause();
    }
}

/// Lets the parent's threads back into guarded regions.
#[cfg(any(test, feature = "global"))]
pub fn postfork_parent() {
    STATE.fetch_and(!FORKING, Release);
}

/// The child has a single thread, which held no guard while forking.
#[cfg(any(test, feature = "global"))]
pub fn postfork_child() {
    STATE.store(0, Release);
}

/// Installs [`prefork`], [`postfork_parent`] and [`postfork_child`] with
/// `pthread_atfork`, once per process.
#[cfg(feature = "global")]
pub fn register_fork_handlers() {
    use core::sync::atomic::AtomicBool;

    static REGISTERED: AtomicBool = AtomicBool::new(false);

    unsafe extern "C" fn prepare() {
        prefork()
    }
    unsafe extern "C" fn parent() {
        postfork_parent()
    }
    unsafe extern "C" fn child() {
        postfork_child()
    }

    if REGISTERED.swap(true, AcqRel) {
        return;
    }
    // SAFETY: the handlers never unwind.
    let ret = unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) };
    if ret != 0 {
        log_at!(warn, "pthread_atfork failed: {ret}");
    }
}
