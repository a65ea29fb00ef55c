//! The heap of the current thread.
//!
//! A thread takes a heap from the pool of [`GLOBALS`] on its first
//! allocation and hands it back from a pthread key destructor when it exits.
//! The slot itself needs no destructor, so it stays accessible while other
//! thread-local destructors run; a thread that allocates again after its heap
//! was released simply takes another one.

use core::{
    cell::Cell,
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicUsize, Ordering::*},
};

use libc::{pthread_key_create, pthread_key_delete, pthread_key_t, pthread_setspecific};

use super::{GLOBALS, GlobalHeap};
use crate::{error::Error, globals::PooledHeap, sync::fork};

std::thread_local! {
    static HEAP: Cell<Option<&'static GlobalHeap>> = const { Cell::new(None) };
}

/// Runs `f` on the heap of the current thread, taking one from the pool if
/// the thread has none yet.
#[inline]
pub(super) fn with<T>(f: impl FnOnce(&'static GlobalHeap) -> T) -> Result<T, Error> {
    let heap = match HEAP.get() {
        Some(heap) => heap,
        None => init()?,
    };
    Ok(f(heap))
}

/// Runs `f` on the heap of the current thread only if it already has one.
pub(super) fn with_existing<T>(f: impl FnOnce(&'static GlobalHeap) -> T) -> Option<T> {
    HEAP.get().map(f)
}

#[cold]
fn init() -> Result<&'static GlobalHeap, Error> {
    let heap = GLOBALS.acquire()?.into_raw();
    HEAP.set(Some(heap));
    // Both registrations may allocate through libc, which must find the heap
    // already in place.
    register_thread_dtor(ptr::from_ref(heap).cast_mut().cast(), fini);
    fork::register_fork_handlers();
    Ok(heap)
}

unsafe extern "C" fn fini(data: *mut c_void) {
    let heap = data.cast_const().cast::<GlobalHeap>();
    if HEAP.get().is_some_and(|current| ptr::eq(current, heap)) {
        HEAP.set(None);
    }
    // SAFETY: `data` is the heap detached in `init`, and the slot no longer
    // refers to it.
    unsafe { PooledHeap::release(GLOBALS.pool(), &*heap) }
}

/// Arranges for `dtor(data)` to run when the current thread exits.
fn register_thread_dtor(data: *mut c_void, dtor: unsafe extern "C" fn(*mut c_void)) {
    const VAL_INIT: usize = usize::MAX;
    static KEY_INIT: AtomicUsize = AtomicUsize::new(VAL_INIT);

    let mut key = KEY_INIT.load(Acquire);
    if key == VAL_INIT {
        let mut new: pthread_key_t = 0;
        // SAFETY: `new` is a valid out slot.
        let ret = unsafe { pthread_key_create(&mut new, Some(dtor)) };
        if ret != 0 {
            log_at!(warn, "pthread_key_create failed: {ret}; heaps will not be recycled");
            return;
        }
        key = new as usize;

        if let Err(already_set) = KEY_INIT.compare_exchange(VAL_INIT, key, AcqRel, Acquire) {
            // SAFETY: the key was created above and never handed out.
            unsafe { pthread_key_delete(new) };
            key = already_set;
        }
    }

    // SAFETY: `key` is a live key of this process.
    let ret = unsafe { pthread_setspecific(key as pthread_key_t, data) };
    if ret != 0 {
        log_at!(warn, "pthread_setspecific failed: {ret}");
    }
}
