#![no_main]

//! Drives heaps of a private, fully hardened instance directly.

use std::{iter, sync::Mutex, thread};

use libfuzzer_sys::fuzz_target;
use postalloc::{config::Mitigations, globals::Globals, heap::Heap, pal::UnixPal, sizeclass};

mod common;
use self::common::*;

static GLOBALS: Globals<'static, UnixPal> = Globals::new(UnixPal::new(true), Mitigations::HARDENED);

fuzz_target!(|action_sets: [Vec<Action>; THREADS]| {
    let transfers: Vec<Mutex<Option<Allocation>>> =
        iter::repeat_with(|| Mutex::new(None)).take(TRANSFER_COUNT).collect();

    thread::scope(|s| {
        for actions in action_sets {
            s.spawn(|| {
                let heap = GLOBALS.acquire().unwrap();
                fuzz_one(&heap, actions, &transfers);
            });
        }
    });

    // Whatever is left in the slots is freed by a heap that never owned it.
    let heap = GLOBALS.acquire().unwrap();
    for slot in transfers {
        if let Some(a) = slot.into_inner().unwrap() {
            free(&heap, a);
        }
    }
});

fn free(heap: &Heap<'static, UnixPal>, a: Allocation) {
    let (ptr, layout) = a.into_raw();
    unsafe { heap.dealloc_sized(ptr.as_ptr(), layout.size()) }
}

fn fuzz_one(heap: &Heap<'static, UnixPal>, actions: Vec<Action>, transfers: &[Mutex<Option<Allocation>>]) {
    let mut allocations = Vec::new();

    for action in actions {
        match action {
            Action::Allocate { size, align_shift, zeroed } => {
                let layout = Action::layout(size, align_shift);
                let res = if zeroed {
                    heap.alloc_zeroed(sizeclass::aligned_size(layout.align(), layout.size().max(1)))
                } else {
                    heap.alloc_aligned(layout.align(), layout.size())
                };
                if let Ok(ptr) = res {
                    allocations.push(Allocation::new(ptr, layout, zeroed));
                }
            }
            Action::Deallocate { index } => {
                if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                    free(heap, allocations.swap_remove(index));
                }
            }
            Action::Reallocate { .. } => heap.handle_message_queue(),
            Action::UsableSize { index } => {
                if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                    let a = &allocations[index];
                    assert!(GLOBALS.alloc_size(a.ptr.as_ptr()) >= a.layout.size().max(1));
                    assert_eq!(GLOBALS.start_of_object(a.ptr.as_ptr().addr()), a.ptr.as_ptr().addr());
                }
            }
            Action::Flush => {
                heap.flush();
            }
            Action::Transfer { from, to } => {
                if let Some(from) = (from as usize).checked_rem(allocations.len())
                    && let Some(to) = (to as usize).checked_rem(transfers.len())
                {
                    let a = allocations.swap_remove(from);
                    let o = transfers[to].lock().unwrap().replace(a);
                    if let Some(a) = o {
                        allocations.push(a);
                    }
                }
            }
        }
    }

    allocations.into_iter().for_each(|a| free(heap, a));
}
