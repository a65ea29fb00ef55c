//! The C interface.
//!
//! The symbols are prefixed with `pa_`, or carry the bare libc names with
//! the `c-override` feature so that the allocator replaces the system one.

use core::{
    alloc::Layout,
    ffi::{c_int, c_void},
    ptr::{self, NonNull},
};

use crate::{PostAlloc, config::Mitigations, error::Corruption, pal, sizeclass};

fn alloc(align: usize, size: usize, zeroed: bool) -> *mut c_void {
    let Ok(layout) = Layout::from_size_align(size, align) else {
        errno::set_errno(errno::Errno(libc::ENOMEM));
        return ptr::null_mut();
    };
    let res = if zeroed {
        PostAlloc.allocate_zeroed(layout)
    } else {
        PostAlloc.allocate(layout)
    };
    match res {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(_) => {
            errno::set_errno(errno::Errno(libc::ENOMEM));
            ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
#[cfg_attr(not(feature = "c-override"), unsafe(export_name = "pa_malloc"))]
pub extern "C" fn malloc(size: usize) -> *mut c_void {
    alloc(1, size, false)
}

#[unsafe(no_mangle)]
#[cfg_attr(not(feature = "c-override"), unsafe(export_name = "pa_calloc"))]
pub extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(size) = nmemb.checked_mul(size) else {
        errno::set_errno(errno::Errno(libc::ENOMEM));
        return ptr::null_mut();
    };
    alloc(1, size, true)
}

#[unsafe(no_mangle)]
#[cfg_attr(not(feature = "c-override"), unsafe(export_name = "pa_free"))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // SAFETY: the caller passes null or a live block.
    unsafe { PostAlloc.free(ptr.cast()) }
}

#[unsafe(no_mangle)]
#[cfg_attr(not(feature = "c-override"), unsafe(export_name = "pa_realloc"))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    let Some(old) = NonNull::new(ptr.cast::<u8>()) else {
        return malloc(new_size);
    };
    if new_size == 0 {
        // SAFETY: `old` is a live block.
        unsafe { free(ptr) };
        return malloc(0);
    }
    let usable = PostAlloc.usable_size(old.as_ptr());
    if sizeclass::round_size(new_size) == usable {
        return ptr;
    }
    let new = malloc(new_size);
    if !new.is_null() {
        // SAFETY: both blocks are live and distinct. Unowned blocks report a
        // usable size of 0 and copy nothing.
        unsafe {
            new.cast::<u8>().copy_from_nonoverlapping(old.as_ptr(), usable.min(new_size));
            free(ptr);
        }
    }
    new
}

#[unsafe(no_mangle)]
#[cfg_attr(not(feature = "c-override"), unsafe(export_name = "pa_malloc_usable_size"))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *const c_void) -> usize {
    PostAlloc.usable_size(ptr.cast())
}

#[unsafe(no_mangle)]
#[cfg_attr(not(feature = "c-override"), unsafe(export_name = "pa_posix_memalign"))]
pub unsafe extern "C" fn posix_memalign(slot: *mut *mut c_void, align: usize, size: usize) -> c_int {
    if slot.is_null() || !align.is_power_of_two() || align < size_of::<usize>() {
        return libc::EINVAL;
    }
    let ptr = alloc(align, size, false);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    // SAFETY: `slot` is non-null and writable by contract.
    unsafe { slot.write(ptr) };
    0
}

#[unsafe(no_mangle)]
#[cfg_attr(not(feature = "c-override"), unsafe(export_name = "pa_aligned_alloc"))]
pub extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    if !align.is_power_of_two() {
        errno::set_errno(errno::Errno(libc::EINVAL));
        return ptr::null_mut();
    }
    alloc(align, size, false)
}

#[unsafe(no_mangle)]
#[cfg_attr(not(feature = "c-override"), unsafe(export_name = "pa_memalign"))]
pub extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
    aligned_alloc(align, size)
}

/// Copies `len` bytes, refusing copies that run past the end of a heap
/// block at either end when sanity checks are on.
///
/// Always exported as `pa_memcpy`; the libc `memcpy` is left alone.
#[unsafe(export_name = "pa_memcpy")]
pub unsafe extern "C" fn checked_memcpy(dst: *mut c_void, src: *const c_void, len: usize) -> *mut c_void {
    let globals = PostAlloc.globals();
    if globals.mitigations().contains(Mitigations::SANITY_CHECKS) && len > 0 {
        for addr in [dst.addr(), src.addr()] {
            if globals.remaining_bytes(addr) < len {
                pal::fatal(globals.backend().pal(), Corruption::CopyOverflow { addr, len }.into());
            }
        }
    }
    // A plain loop: `copy_nonoverlapping` may lower to a call to `memcpy`.
    let (dst8, src8) = (dst.cast::<u8>(), src.cast::<u8>());
    for i in 0..len {
        // SAFETY: the caller guarantees both ranges are valid and disjoint.
        unsafe { dst8.add(i).write_volatile(src8.add(i).read()) };
    }
    dst
}

#[unsafe(no_mangle)]
pub extern "C" fn rust_alloc(align: usize, size: usize) -> *mut c_void {
    alloc(align, size, false)
}

#[unsafe(no_mangle)]
pub extern "C" fn rust_alloc_zeroed(align: usize, size: usize) -> *mut c_void {
    alloc(align, size, true)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rust_dealloc(ptr: *mut c_void, align: usize, size: usize) {
    match (NonNull::new(ptr.cast::<u8>()), Layout::from_size_align(size, align)) {
        // SAFETY: the caller passes a live block allocated with this layout.
        (Some(ptr), Ok(layout)) => unsafe { PostAlloc.deallocate(ptr, layout) },
        // SAFETY: as above.
        (_, Err(_)) => unsafe { PostAlloc.free(ptr.cast()) },
        (None, Ok(_)) => {}
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rust_realloc(
    ptr: *mut c_void,
    align: usize,
    old_size: usize,
    new_size: usize,
) -> *mut c_void {
    let Some(old) = NonNull::new(ptr.cast::<u8>()) else {
        return rust_alloc(align, new_size);
    };
    // The old block stays untouched when the request cannot be honored.
    let (Ok(layout), Ok(_)) = (
        Layout::from_size_align(old_size, align),
        Layout::from_size_align(new_size, align),
    ) else {
        return ptr::null_mut();
    };
    // SAFETY: the caller passes a live block allocated with this layout.
    match unsafe { PostAlloc.reallocate(old, layout, new_size) } {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(_) => ptr::null_mut(),
    }
}

/// Stores the bytes currently committed and their peak.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rust_statistics(current: *mut usize, peak: *mut usize) {
    let stat = PostAlloc.stat();
    // SAFETY: non-null out pointers are writable by contract.
    unsafe {
        if !current.is_null() {
            current.write(stat.current);
        }
        if !peak.is_null() {
            peak.write(stat.peak);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_realloc_keeps_the_block() {
        let block = rust_alloc(8, 100).cast::<u8>();
        assert!(!block.is_null());
        unsafe { block.write_bytes(7, 100) };

        assert!(unsafe { rust_realloc(block.cast(), 3, 100, 200) }.is_null());
        assert!(unsafe { rust_realloc(block.cast(), 8, 100, isize::MAX as usize) }.is_null());
        assert_eq!(PostAlloc.usable_size(block), sizeclass::round_size(100));
        assert_eq!(unsafe { block.add(99).read() }, 7);

        let moved = unsafe { rust_realloc(block.cast(), 8, 100, 5000) }.cast::<u8>();
        assert!(!moved.is_null());
        assert_eq!(unsafe { moved.add(99).read() }, 7);
        unsafe { rust_dealloc(moved.cast(), 8, 5000) };
    }
}
