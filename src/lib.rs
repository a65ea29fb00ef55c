//! A thread-caching memory allocator that frees across threads by message
//! passing.
//!
//! Every thread owns a [`Heap`](heap::Heap). Small objects are carved out of
//! slabs whose free lists are obfuscated and signed, so that corruption of a
//! freed object is detected before the allocator follows it. Objects freed by
//! a thread that does not own them are batched and posted to the owner's
//! message queue instead of touching the owner's data structures.
//!
//! # Usage
//!
//! With the default `global` feature, the crate provides a process-wide
//! allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOC: postalloc::PostAlloc = postalloc::PostAlloc;
//! ```
//!
//! Custom instances can be assembled from a [`Globals`](globals::Globals)
//! over any [`Pal`](pal::Pal).
//!
//! # Features
//!
//! - `global` - the process-wide [`PostAlloc`] instance and thread-local heaps.
//! - `c` / `c-override` - C ABI functions, prefixed with `pa_` or overriding
//!   the libc allocator.
//! - `error-log` - route diagnostics to the [`log`](https://docs.rs/log) facade.
//! - `track-valgrind` - valgrind client requests.
//! - one feature per hardening mitigation, plus `hardened` for all of them;
//!   see [`Mitigations`](config::Mitigations).
#![no_std]

#[cfg(any(test, feature = "global"))]
extern crate std;

macro_rules! log_at {
    ($level:ident, $($arg:tt)+) => {{
        #[cfg(feature = "error-log")]
        ::log::$level!(target: "postalloc", $($arg)+);
        #[cfg(not(feature = "error-log"))]
        let _ = format_args!($($arg)+);
    }};
}

pub mod aal;
pub mod backend;
pub mod bits;
#[cfg(feature = "c")]
mod c;
pub mod config;
pub mod entropy;
pub mod error;
#[cfg(feature = "global")]
mod global;
pub mod globals;
pub mod heap;
pub mod pal;
pub mod pool;
pub mod ptr;
pub mod remote;
pub mod sizeclass;
pub mod slab;
pub mod stat;
pub mod sync;
mod track;

#[cfg(feature = "global")]
#[allow(unused_imports)]
pub use self::global::*;

#[cfg(all(test, feature = "global"))]
mod test {
    use core::alloc::Layout;
    use std::{sync::mpsc, thread, vec, vec::Vec};

    use crate::{PostAlloc, sizeclass::MAX_SMALL_SIZECLASS_SIZE};

    #[global_allocator]
    static ALLOC: PostAlloc = PostAlloc;

    #[test]
    fn basic() {
        let mut vec = vec![1, 2, 3, 4];
        vec.extend([5, 6, 7, 8]);
        assert_eq!(vec.iter().sum::<i32>(), 10 + 26);
        drop(vec);
    }

    #[test]
    fn large() {
        let mut vec = vec![0u8; MAX_SMALL_SIZECLASS_SIZE * 5 + 3];
        vec[MAX_SMALL_SIZECLASS_SIZE / 2] = 123;
        assert!(ALLOC.usable_size(vec.as_ptr()) >= vec.len());
        drop(vec)
    }

    #[test]
    fn aligned() {
        let layout = Layout::from_size_align(12345, 1 << 16).unwrap();
        let ptr = ALLOC.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr().addr() % (1 << 16), 0);
        unsafe { ALLOC.deallocate(ptr, layout) }
    }

    #[test]
    fn zero_sized() {
        let layout = Layout::from_size_align(0, 1).unwrap();
        let ptr = ALLOC.allocate(layout).unwrap();
        assert!(ALLOC.usable_size(ptr.as_ptr()) >= 1);
        unsafe { ALLOC.deallocate(ptr, layout) }
    }

    #[test]
    fn multithread() {
        let mut vec = vec![0u8; 100];
        vec.extend([1; 100]);
        let j = thread::spawn(move || drop(vec));
        j.join().unwrap();
    }

    #[test]
    fn ping_pong() {
        let (tx, rx) = mpsc::channel::<Vec<u64>>();
        let j = thread::spawn(move || {
            let mut total = 0;
            for v in rx {
                total += v.iter().sum::<u64>();
            }
            total
        });
        for round in 0..1000u64 {
            tx.send((0..(round % 40)).collect()).unwrap();
        }
        drop(tx);
        let expected: u64 = (0..1000u64).map(|r| (0..(r % 40)).sum::<u64>()).sum();
        assert_eq!(j.join().unwrap(), expected);
        ALLOC.flush();
    }
}
