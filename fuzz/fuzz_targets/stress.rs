#![no_main]

use std::{iter, sync::Mutex, thread};

use libfuzzer_sys::fuzz_target;
use postalloc::PostAlloc;

mod common;
use self::common::*;

#[global_allocator]
static ALLOC: PostAlloc = PostAlloc;

/// A block of the global allocator, freed on drop.
struct Owned(Allocation);

impl Drop for Owned {
    fn drop(&mut self) {
        self.0.check();
        unsafe { ALLOC.deallocate(self.0.ptr, self.0.layout) }
    }
}

fuzz_target!(|action_sets: [Vec<Action>; THREADS]| {
    let transfers: Vec<Mutex<Option<Owned>>> =
        iter::repeat_with(|| Mutex::new(None)).take(TRANSFER_COUNT).collect();

    thread::scope(|s| {
        for actions in action_sets {
            s.spawn(|| fuzz_one(actions, &transfers));
        }
    });
});

fn fuzz_one(actions: Vec<Action>, transfers: &[Mutex<Option<Owned>>]) {
    let mut allocations = Vec::new();

    actions.into_iter().for_each(|action| match action {
        Action::Allocate { size, align_shift, zeroed } => {
            let layout = Action::layout(size, align_shift);
            let res = if zeroed { ALLOC.allocate_zeroed(layout) } else { ALLOC.allocate(layout) };
            if let Ok(ptr) = res {
                allocations.push(Owned(Allocation::new(ptr, layout, zeroed)));
            }
        }
        Action::Deallocate { index } => {
            if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                drop(allocations.swap_remove(index));
            }
        }
        Action::Reallocate { index, size } => {
            if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                let new_size = (size % (1 << 24)) as usize;
                let (ptr, layout) = std::mem::ManuallyDrop::new(allocations.swap_remove(index)).0.into_raw();
                match unsafe { ALLOC.reallocate(ptr, layout, new_size) } {
                    Ok(new) => {
                        let layout = std::alloc::Layout::from_size_align(new_size, layout.align()).unwrap();
                        allocations.push(Owned(Allocation::new(new, layout, false)));
                    }
                    Err(_) => allocations.push(Owned(Allocation { ptr, layout })),
                }
            }
        }
        Action::UsableSize { index } => {
            if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                let a = &allocations[index].0;
                assert!(ALLOC.usable_size(a.ptr.as_ptr()) >= a.layout.size().max(1));
            }
        }
        Action::Flush => ALLOC.flush(),
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
    });
}
