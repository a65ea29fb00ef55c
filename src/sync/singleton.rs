use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering::*},
};

use crate::aal;

const UNINIT: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;

/// A value initialized once, on first use, without allocating.
///
/// Concurrent first users spin until the winner's initializer returns.
pub struct Singleton<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the value is written once before being shared.
unsafe impl<T: Send + Sync> Sync for Singleton<T> {}

impl<T> Singleton<T> {
    pub const fn new() -> Self {
        Singleton {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: READY is only published after the value is written.
        (self.state.load(Acquire) == READY).then(|| unsafe { (*self.value.get()).assume_init_ref() })
    }

    #[inline]
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        match self.get() {
            Some(value) => value,
            None => self.init_slow(init),
        }
    }

    #[cold]
    fn init_slow(&self, init: impl FnOnce() -> T) -> &T {
        match self.state.compare_exchange(UNINIT, BUSY, Acquire, Acquire) {
            Ok(_) => {
                // SAFETY: BUSY grants exclusive access.
                unsafe { (*self.value.get()).write(init()) };
                self.state.store(READY, Release);
            }
            Err(_) => {
                while self.state.load(Acquire) != READY {
                    aal::pause();
                }
            }
        }
        // SAFETY: the state is READY.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Default for Singleton<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Singleton<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: the value was initialized.
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering::*},
        },
        thread,
        vec::Vec,
    };

    use super::Singleton;

    #[test]
    fn initialized_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cell = Arc::new(Singleton::new());
        assert!(cell.get().is_none());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let (calls, cell) = (calls.clone(), cell.clone());
                thread::spawn(move || {
                    *cell.get_or_init(|| {
                        calls.fetch_add(1, SeqCst);
                        i
                    })
                })
            })
            .collect();
        let values: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(SeqCst), 1);
        assert!(values.iter().all(|&v| v == values[0]));
        assert_eq!(cell.get(), Some(&values[0]));
    }
}
