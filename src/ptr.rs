//! Bounded pointers.
//!
//! A [`CapPtr`] is a plain pointer tagged at the type level with the spatial
//! extent it may be used for ([`Bound`]) and whether it has been checked
//! against the allocator's own bookkeeping ([`Trust`]). Narrowing is only
//! possible towards a smaller bound, which the trait system enforces.

use core::{fmt, marker::PhantomData, ptr::NonNull};

use crate::aal;

mod sealed {
    pub trait Sealed {}
}

/// The spatial extent a [`CapPtr`] is allowed to address.
pub trait Bound: sealed::Sealed + Copy + 'static {
    const NAME: &'static str;
}

/// Implemented by `B` when `B` is no wider than `Self`.
pub trait Contains<B: Bound>: Bound {}

/// Whether a pointer's provenance has been checked.
pub trait Trust: sealed::Sealed + Copy + 'static {
    const NAME: &'static str;
}

/// A whole OS reservation.
#[derive(Debug, Clone, Copy)]
pub struct Arena;
/// One chunk handed out by the backend.
#[derive(Debug, Clone, Copy)]
pub struct Chunk;
/// A single client object.
#[derive(Debug, Clone, Copy)]
pub struct Alloc;

/// Unverified, e.g. supplied by a caller or read from a free object.
#[derive(Debug, Clone, Copy)]
pub struct Wild;
/// Verified to lie within memory owned by the allocator.
#[derive(Debug, Clone, Copy)]
pub struct Tame;

macro_rules! impl_marker {
    ($trait:ident: $($ty:ident),*) => {$(
        impl sealed::Sealed for $ty {}
        impl $trait for $ty {
            const NAME: &'static str = stringify!($ty);
        }
    )*};
}
impl_marker!(Bound: Arena, Chunk, Alloc);
impl_marker!(Trust: Wild, Tame);

impl Contains<Arena> for Arena {}
impl Contains<Chunk> for Arena {}
impl Contains<Alloc> for Arena {}
impl Contains<Chunk> for Chunk {}
impl Contains<Alloc> for Chunk {}
impl Contains<Alloc> for Alloc {}

pub struct CapPtr<T, B: Bound, W: Trust> {
    ptr: NonNull<T>,
    marker: PhantomData<(B, W)>,
}

impl<T, B: Bound, W: Trust> Clone for CapPtr<T, B, W> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, B: Bound, W: Trust> Copy for CapPtr<T, B, W> {}

impl<T, B: Bound, W: Trust> PartialEq for CapPtr<T, B, W> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T, B: Bound, W: Trust> Eq for CapPtr<T, B, W> {}

impl<T, B: Bound, W: Trust> fmt::Debug for CapPtr<T, B, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapPtr<{}, {}>({:p})", B::NAME, W::NAME, self.ptr)
    }
}

impl<T, B: Bound> CapPtr<T, B, Wild> {
    /// Wraps an unverified pointer.
    pub const fn new_wild(ptr: NonNull<T>) -> Self {
        CapPtr { ptr, marker: PhantomData }
    }

    /// Checks the pointer with `check`, promoting it on success.
    #[inline]
    pub fn domesticate(self, check: impl FnOnce(usize) -> bool) -> Option<CapPtr<T, B, Tame>> {
        check(self.addr()).then_some(CapPtr { ptr: self.ptr, marker: PhantomData })
    }
}

impl<T, B: Bound> CapPtr<T, B, Tame> {
    /// Wraps a pointer the allocator produced itself.
    ///
    /// # Safety
    ///
    /// `ptr` must lie within memory owned by the allocator, within bound `B`.
    pub const unsafe fn new_tame(ptr: NonNull<T>) -> Self {
        CapPtr { ptr, marker: PhantomData }
    }

    /// Forgets the verification, e.g. before handing the pointer to a client.
    pub fn into_wild(self) -> CapPtr<T, B, Wild> {
        CapPtr { ptr: self.ptr, marker: PhantomData }
    }
}

impl<T, B: Bound, W: Trust> CapPtr<T, B, W> {
    /// Narrows this pointer to a smaller extent of `size` bytes.
    #[inline]
    pub fn narrow<B2: Bound>(self, size: usize) -> CapPtr<T, B2, W>
    where
        B: Contains<B2>,
    {
        CapPtr {
            ptr: aal::capptr_bound(self.ptr, size),
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn cast<U>(self) -> CapPtr<U, B, W> {
        CapPtr { ptr: self.ptr.cast(), marker: PhantomData }
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.ptr.as_ptr().addr()
    }

    #[inline]
    pub fn as_non_null(self) -> NonNull<T> {
        self.ptr
    }

    #[inline]
    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use super::*;

    #[test]
    fn narrow_and_domesticate() {
        let mut slot = [0u64; 4];
        let raw = NonNull::from(&mut slot).cast::<u8>();
        let chunk: CapPtr<u8, Chunk, Wild> = CapPtr::new_wild(raw);
        let alloc: CapPtr<u8, Alloc, Wild> = chunk.narrow(8);
        assert_eq!(alloc.addr(), raw.as_ptr().addr());

        let start = raw.as_ptr().addr();
        let tame = alloc.domesticate(|addr| (start..start + 32).contains(&addr));
        assert!(tame.is_some());
        let rejected = alloc.domesticate(|_| false);
        assert!(rejected.is_none());
    }
}
