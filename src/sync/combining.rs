//! A flat-combining lock.
//!
//! Uncontended, the lock is a single flag swap. Under contention, callers
//! queue their closures in an MCS queue of stack-allocated nodes; the thread
//! at the head of the queue acquires the flag and runs the queued closures
//! one after another on behalf of their owners, so the protected data stays
//! in one core's cache and the lock is not handed back and forth.

use core::{
    cell::UnsafeCell,
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering::*},
};

use super::PreventFork;
use crate::{aal, pal::Wait};

const WAITING: u32 = 0;
/// The node's closure has been run by another thread.
const DONE: u32 = 1;
/// The node is now the head of the queue and must combine.
const READY: u32 = 2;
/// The owner is blocked in [`Wait::wait`] and must be woken.
const SLEEPING: u32 = 3;

/// Spins on a node's status before going to sleep.
const SPIN_BUDGET: usize = 1 << 10;
/// The number of closures one thread runs before handing the queue over.
const COMBINE_LIMIT: usize = 64;

struct Node<T> {
    status: AtomicU32,
    next: AtomicPtr<Node<T>>,
    data: *mut (),
    run: unsafe fn(*mut (), &mut T),
}

/// Calls the closure behind `data`.
///
/// # Safety
///
/// `data` must point to a live `F`.
unsafe fn trampoline<T, F: FnMut(&mut T)>(data: *mut (), value: &mut T) {
    unsafe { (*data.cast::<F>())(value) }
}

impl<T> Node<T> {
    /// # Safety
    ///
    /// `node` must be alive. It may be released by its owner as soon as the
    /// store is visible, so it is not touched afterwards except as a wake-up
    /// key.
    unsafe fn set_status<W: Wait + ?Sized>(waiter: &W, node: NonNull<Self>, status: u32) {
        let word = unsafe { &raw const (*node.as_ptr()).status };
        let old = unsafe { (*word).swap(status, Release) };
        if old == SLEEPING {
            unsafe { waiter.wake_one(word) }
        }
    }

    fn wait<W: Wait + ?Sized>(&self, waiter: &W) -> u32 {
        for _ in 0..SPIN_BUDGET {
            let status = self.status.load(Acquire);
            if status != WAITING {
                return status;
            }
            aal::pause();
        }
        loop {
            match self.status.compare_exchange(WAITING, SLEEPING, Acquire, Acquire) {
                Ok(_) | Err(SLEEPING) => waiter.wait(&self.status, SLEEPING),
                Err(status) => return status,
            }
        }
    }
}

pub struct CombiningLock<T> {
    flag: AtomicBool,
    last: AtomicPtr<Node<T>>,
    data: UnsafeCell<T>,
}

// SAFETY: all access to `data` happens under the flag.
unsafe impl<T: Send> Send for CombiningLock<T> {}
// SAFETY: all access to `data` happens under the flag.
unsafe impl<T: Send> Sync for CombiningLock<T> {}

impl<T> CombiningLock<T> {
    pub const fn new(data: T) -> Self {
        CombiningLock {
            flag: AtomicBool::new(false),
            last: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(data),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Runs `f` with exclusive access to the protected data, possibly on
    /// another thread that is combining queued work.
    pub fn with<W, F, R>(&self, waiter: &W, f: F) -> R
    where
        W: Wait + ?Sized,
        F: FnOnce(&mut T) -> R,
    {
        let _fork = PreventFork::new();

        if self.last.load(Relaxed).is_null() && !self.flag.swap(true, Acquire) {
            // SAFETY: we hold the flag.
            let ret = f(unsafe { &mut *self.data.get() });
            self.flag.store(false, Release);
            return ret;
        }

        let mut f = Some(f);
        let mut ret = None;
        let mut run = |value: &mut T| {
            if let Some(f) = f.take() {
                ret = Some(f(value));
            }
        };
        self.with_slow(waiter, &mut run);
        match ret {
            Some(ret) => ret,
            // Every queued node is run exactly once before being marked done.
            None => unreachable!("combined closure was never run"),
        }
    }

    #[cold]
    fn with_slow<W, F>(&self, waiter: &W, run: &mut F)
    where
        W: Wait + ?Sized,
        F: FnMut(&mut T),
    {
        let node = Node {
            status: AtomicU32::new(WAITING),
            next: AtomicPtr::new(ptr::null_mut()),
            data: ptr::from_mut(run).cast(),
            run: trampoline::<T, F>,
        };
        let this = NonNull::from(&node);

        let prev = self.last.swap(this.as_ptr(), AcqRel);
        if let Some(prev) = NonNull::new(prev) {
            // SAFETY: `prev` stays alive until its successor link is read.
            unsafe { prev.as_ref().next.store(this.as_ptr(), Release) };
            if node.wait(waiter) == DONE {
                return;
            }
        }

        while self.flag.swap(true, Acquire) {
            while self.flag.load(Relaxed) {
                aal::pause();
            }
        }

        let mut curr = this;
        let mut count = 0;
        loop {
            // SAFETY: `curr` is queued and waiting, so its closure is alive,
            // and we hold the flag.
            unsafe {
                let node = curr.as_ref();
                (node.run)(node.data, &mut *self.data.get());
            }
            count += 1;

            // SAFETY: `curr` is alive until marked done.
            let mut next = unsafe { curr.as_ref().next.load(Acquire) };
            if next.is_null() {
                if self
                    .last
                    .compare_exchange(curr.as_ptr(), ptr::null_mut(), Release, Relaxed)
                    .is_ok()
                {
                    self.flag.store(false, Release);
                    if curr != this {
                        // SAFETY: `curr` is alive until this store.
                        unsafe { Node::set_status(waiter, curr, DONE) };
                    }
                    return;
                }
                // A successor is linking itself in.
                loop {
                    // SAFETY: as above.
                    next = unsafe { curr.as_ref().next.load(Acquire) };
                    if !next.is_null() {
                        break;
                    }
                    aal::pause();
                }
            }

            if curr != this {
                // SAFETY: `next` was read before releasing `curr`.
                unsafe { Node::set_status(waiter, curr, DONE) };
            }
            // SAFETY: non-null checked above.
            curr = unsafe { NonNull::new_unchecked(next) };

            if count >= COMBINE_LIMIT {
                self.flag.store(false, Release);
                // SAFETY: `curr` is waiting for its status to change.
                unsafe { Node::set_status(waiter, curr, READY) };
                return;
            }
        }
    }
}

impl<T: Default> Default for CombiningLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for CombiningLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombiningLock")
            .field("locked", &self.flag.load(Relaxed))
            .field("queued", &!self.last.load(Relaxed).is_null())
            .finish_non_exhaustive()
    }
}
