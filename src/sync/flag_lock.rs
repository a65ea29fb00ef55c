use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering::*},
};

use super::PreventFork;
use crate::aal;

/// A test-and-test-and-set spin lock.
///
/// Holding the lock also prevents the process from forking, so a child never
/// inherits the protected data mid-update.
pub struct FlagLock<T: ?Sized> {
    flag: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to `data`.
unsafe impl<T: ?Sized + Send> Send for FlagLock<T> {}
// SAFETY: the lock serializes all access to `data`.
unsafe impl<T: ?Sized + Send> Sync for FlagLock<T> {}

impl<T> FlagLock<T> {
    pub const fn new(data: T) -> Self {
        FlagLock {
            flag: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> FlagLock<T> {
    pub fn lock(&self) -> FlagLockGuard<'_, T> {
        let fork = PreventFork::new();
        while self.flag.swap(true, Acquire) {
            while self.flag.load(Relaxed) {
                aal::pause();
            }
        }
        FlagLockGuard { lock: self, _fork: fork }
    }

    pub fn try_lock(&self) -> Option<FlagLockGuard<'_, T>> {
        let fork = PreventFork::new();
        (!self.flag.swap(true, Acquire)).then(|| FlagLockGuard { lock: self, _fork: fork })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn is_locked(&self) -> bool {
        self.flag.load(Relaxed)
    }
}

impl<T: Default> Default for FlagLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for FlagLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

#[must_use = "the lock is released when the guard is dropped"]
pub struct FlagLockGuard<'a, T: ?Sized> {
    lock: &'a FlagLock<T>,
    _fork: PreventFork,
}

impl<T: ?Sized> Deref for FlagLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FlagLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for FlagLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Release);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, vec::Vec};

    use super::FlagLock;

    #[test]
    fn counter() {
        let lock = Arc::new(FlagLock::new(0usize));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..10000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(*lock.lock(), 40000);

        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
