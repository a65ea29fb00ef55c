//! Threads allocate, retain and hand blocks to each other at random, then
//! the same load runs on the system allocator for comparison.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    iter,
    ptr::NonNull,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use postalloc::PostAlloc;

const COOKIE: usize = 0xbf58476d1ce4e5b9;
const THREADS: usize = 6;
#[cfg(not(debug_assertions))]
const SCALE: usize = 5000;
#[cfg(debug_assertions)]
const SCALE: usize = 10;
#[cfg(not(debug_assertions))]
const ITER: usize = 25;
#[cfg(debug_assertions)]
const ITER: usize = 1;
#[cfg(not(debug_assertions))]
const TRANSFER_COUNT: usize = 1000;
#[cfg(debug_assertions)]
const TRANSFER_COUNT: usize = 20;

fn main() {
    println!("postalloc: {:?}", do_bench(&PostAlloc));
    let stat = PostAlloc.stat();
    println!(
        "  current {} KiB, peak {} KiB, reserved {} KiB, {} heaps",
        stat.current >> 10,
        stat.peak >> 10,
        stat.reserved >> 10,
        stat.heaps
    );
    #[cfg(not(debug_assertions))]
    println!("system: {:?}", do_bench(&System));
    #[cfg(debug_assertions)]
    let _ = System;
}

fn do_bench<A: GlobalAlloc + Sync>(a: &A) -> Duration {
    let mut transfer: Vec<Mutex<Option<Items<'_, A>>>> =
        iter::repeat_with(|| Mutex::new(None)).take(TRANSFER_COUNT).collect();
    let start = Instant::now();
    for _ in 0..ITER {
        thread::scope(|s| {
            let transfer = &transfer;
            for tid in 0..THREADS {
                s.spawn(move || bench_one(tid, transfer, a));
            }
        });
        transfer.iter_mut().filter(|_| probably(50)).for_each(|t| *t.get_mut().unwrap() = None);
    }
    drop(transfer);
    start.elapsed()
}

fn bench_one<'a, A: GlobalAlloc>(tid: usize, transfer: &[Mutex<Option<Items<'a, A>>>], a: &'a A) {
    let mut alloc_count: usize = SCALE * (tid % 8 + 1);
    let mut retain_count: usize = alloc_count / 2;

    let mut retained = Vec::with_capacity(retain_count);
    let mut data = Vec::new();

    while alloc_count > 0 || retain_count > 0 {
        if retain_count == 0 || (probably(50) && alloc_count > 0) {
            data.push(Some(Items::new(1 << fastrand::u32(0..5), a)));
            alloc_count -= 1;
        } else {
            retained.push(Some(Items::new(1 << fastrand::u32(0..5), a)));
            retain_count -= 1;
        }

        if probably(67) && !data.is_empty() {
            let index = fastrand::usize(0..data.len());
            data[index] = None;
        }

        if probably(25) && !data.is_empty() {
            let di = fastrand::usize(0..data.len());
            let ti = fastrand::usize(0..transfer.len());
            let mut slot = transfer[ti].lock().unwrap();
            std::mem::swap(&mut data[di], &mut *slot);
        }
    }
    retained.iter().chain(data.iter()).flatten().for_each(Items::check);
}

fn probably(percent: u32) -> bool {
    fastrand::u32(0..100) < percent
}

/// An array of `usize` stamped with a per-item cookie, allocated from `A`.
struct Items<'a, A: GlobalAlloc> {
    ptr: NonNull<usize>,
    len: usize,
    alloc: &'a A,
}

unsafe impl<A: GlobalAlloc + Sync> Send for Items<'_, A> {}

impl<'a, A: GlobalAlloc> Items<'a, A> {
    fn layout(len: usize) -> Layout {
        Layout::array::<usize>(len).unwrap()
    }

    fn new(mut len: usize, alloc: &'a A) -> Self {
        if probably(1) {
            len *= if probably(1) { 1000 } else { 100 };
        }
        let ptr = unsafe { alloc.alloc(Self::layout(len)) };
        let ptr = NonNull::new(ptr.cast::<usize>()).expect("out of memory");
        for i in 0..len {
            unsafe { ptr.add(i).write((len - i) ^ COOKIE) };
        }
        Items { ptr, len, alloc }
    }

    fn check(&self) {
        for i in 0..self.len {
            let value = unsafe { self.ptr.add(i).read() };
            assert_eq!(value ^ COOKIE, self.len - i, "corrupted item");
        }
    }
}

impl<A: GlobalAlloc> Drop for Items<'_, A> {
    fn drop(&mut self) {
        self.check();
        unsafe { self.alloc.dealloc(self.ptr.as_ptr().cast(), Self::layout(self.len)) }
    }
}
