//! Client requests telling valgrind which bytes the program may touch.
//!
//! Without the `track-valgrind` feature every function compiles to nothing.

use core::ptr::NonNull;

use crate::slab::FreeObject;

#[cfg(feature = "track-valgrind")]
use crabgrind::memcheck::{MemState, alloc, mark_mem};

/// Marks `size` bytes at `ptr` as a live heap block.
#[inline(always)]
pub fn allocate(ptr: NonNull<u8>, size: usize, zeroed: bool) {
    #[cfg(feature = "track-valgrind")]
    alloc::malloc(ptr.as_ptr().cast(), size, 0, zeroed);
    #[cfg(not(feature = "track-valgrind"))]
    let _ = (ptr, size, zeroed);
}

/// Marks the block at `ptr` as freed, except for the words the free list
/// links are written to.
#[inline(always)]
pub fn deallocate(ptr: NonNull<u8>) {
    #[cfg(feature = "track-valgrind")]
    alloc::free(ptr.as_ptr().cast(), 0);
    mark(ptr, size_of::<FreeObject>(), false)
}

/// Freshly committed memory: addressable, contents unspecified.
#[inline(always)]
pub fn undefined(ptr: NonNull<u8>, size: usize) {
    mark(ptr, size, false)
}

/// Decommitted memory: touching it is an error.
#[inline(always)]
pub fn no_access(ptr: NonNull<u8>, size: usize) {
    mark(ptr, size, true)
}

#[inline(always)]
fn mark(ptr: NonNull<u8>, size: usize, no_access: bool) {
    #[cfg(feature = "track-valgrind")]
    {
        let state = if no_access { MemState::NoAccess } else { MemState::Undefined };
        let _ = mark_mem(ptr.as_ptr().cast(), size, state);
    }
    #[cfg(not(feature = "track-valgrind"))]
    let _ = (ptr, size, no_access);
}
