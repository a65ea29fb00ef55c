//! An ABA-safe lock-free stack.
//!
//! Where the target has 64-bit atomics, the head pointer and a generation
//! counter share one atomic word, and every successful update bumps the
//! generation so a stale compare-and-swap cannot succeed. Elsewhere a spin
//! lock protects the head instead.
//!
//! Items are never freed while linked into any stack, so reading the
//! successor of a head that was concurrently popped is harmless.

use core::{
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering::*},
};

/// An item of an [`AbaStack`].
pub trait AbaLinked: Sized {
    fn aba_next(&self) -> &AtomicPtr<Self>;
}

#[cfg(target_has_atomic = "64")]
mod imp {
    use core::sync::atomic::{AtomicU64, Ordering};

    use crate::aal::ADDRESS_BITS;

    const PTR_BITS: u32 = if ADDRESS_BITS < 64 { ADDRESS_BITS as u32 } else { 48 };
    const PTR_MASK: u64 = (1 << PTR_BITS) - 1;

    pub type Word = u64;

    pub struct Head(AtomicU64);

    impl Head {
        pub const fn new() -> Self {
            Head(AtomicU64::new(0))
        }

        pub fn load(&self, order: Ordering) -> Word {
            self.0.load(order)
        }

        pub fn cas(&self, old: Word, new: Word, success: Ordering) -> Result<(), Word> {
            self.0
                .compare_exchange_weak(old, new, success, Ordering::Relaxed)
                .map(drop)
        }

        pub fn unlock(&self) {}
    }

    pub fn ptr(word: Word) -> usize {
        (word & PTR_MASK) as usize
    }

    pub fn pack(ptr: usize, prev: Word) -> Word {
        debug_assert_eq!(ptr as u64 & !PTR_MASK, 0, "pointer does not fit the packed head");
        let generation = (prev >> PTR_BITS).wrapping_add(1);
        (generation << PTR_BITS) | ptr as u64
    }
}

#[cfg(not(target_has_atomic = "64"))]
mod imp {
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::aal;

    pub type Word = usize;

    /// The head pointer, updated only while `lock` is held. A read takes the
    /// lock and holds it until the read is dropped.
    pub struct Head {
        lock: AtomicBool,
        ptr: AtomicUsize,
    }

    impl Head {
        pub const fn new() -> Self {
            Head {
                lock: AtomicBool::new(false),
                ptr: AtomicUsize::new(0),
            }
        }

        pub fn load(&self, _: Ordering) -> Word {
            while self.lock.swap(true, Ordering::Acquire) {
                aal::pause();
            }
            self.ptr.load(Ordering::Relaxed)
        }

        pub fn cas(&self, old: Word, new: Word, _: Ordering) -> Result<(), Word> {
            debug_assert_eq!(self.ptr.load(Ordering::Relaxed), old);
            self.ptr.store(new, Ordering::Relaxed);
            Ok(())
        }

        pub fn unlock(&self) {
            self.lock.store(false, Ordering::Release);
        }
    }

    pub fn ptr(word: Word) -> usize {
        word
    }

    pub fn pack(ptr: usize, _: Word) -> Word {
        ptr
    }
}

pub struct AbaStack<T: AbaLinked> {
    head: imp::Head,
    marker: PhantomData<*mut T>,
}

// SAFETY: the stack only moves pointers between threads.
unsafe impl<T: AbaLinked + Send> Send for AbaStack<T> {}
// SAFETY: the stack only moves pointers between threads.
unsafe impl<T: AbaLinked + Send> Sync for AbaStack<T> {}

#[cfg(all(debug_assertions, any(test, feature = "global")))]
std::thread_local! {
    static IN_FLIGHT: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// An in-flight read of an [`AbaStack`]'s head.
///
/// Only one may exist per thread at a time.
#[must_use = "a read must be completed or dropped"]
pub struct Cmp<'a, T: AbaLinked> {
    stack: &'a AbaStack<T>,
    old: imp::Word,
}

impl<'a, T: AbaLinked> Cmp<'a, T> {
    fn new(stack: &'a AbaStack<T>, order: core::sync::atomic::Ordering) -> Self {
        #[cfg(all(debug_assertions, any(test, feature = "global")))]
        IN_FLIGHT.with(|f| assert!(!f.replace(true), "nested in-flight reads of an ABA stack"));
        Cmp { stack, old: stack.head.load(order) }
    }

    pub fn ptr(&self) -> Option<NonNull<T>> {
        NonNull::new(ptr::with_exposed_provenance_mut(imp::ptr(self.old)))
    }

    /// Replaces the head with `new` if it is still the value read.
    ///
    /// On failure the read is refreshed, so the caller can retry.
    pub fn store_conditional(&mut self, new: Option<NonNull<T>>) -> bool {
        let new_addr = new.map_or(0, |p| p.as_ptr().expose_provenance());
        match self.stack.head.cas(self.old, imp::pack(new_addr, self.old), AcqRel) {
            Ok(()) => {
                self.old = imp::pack(new_addr, self.old);
                true
            }
            Err(actual) => {
                self.old = actual;
                false
            }
        }
    }
}

impl<T: AbaLinked> Drop for Cmp<'_, T> {
    fn drop(&mut self) {
        #[cfg(all(debug_assertions, any(test, feature = "global")))]
        IN_FLIGHT.with(|f| f.set(false));
        self.stack.head.unlock();
    }
}

impl<T: AbaLinked> AbaStack<T> {
    pub const fn new() -> Self {
        AbaStack { head: imp::Head::new(), marker: PhantomData }
    }

    pub fn read(&self) -> Cmp<'_, T> {
        Cmp::new(self, Acquire)
    }

    /// # Safety
    ///
    /// `item` must stay alive and be linked into no other stack until popped.
    pub unsafe fn push(&self, item: NonNull<T>) {
        unsafe { self.push_list(item, item) }
    }

    /// Pushes the chain from `first` to `last`, linked through
    /// [`AbaLinked::aba_next`].
    ///
    /// # Safety
    ///
    /// See [`AbaStack::push`], for every item of the chain.
    pub unsafe fn push_list(&self, first: NonNull<T>, last: NonNull<T>) {
        let mut cmp = self.read();
        loop {
            let head = cmp.ptr().map_or(ptr::null_mut(), NonNull::as_ptr);
            // SAFETY: `last` is owned by the caller until published.
            unsafe { last.as_ref().aba_next().store(head, Relaxed) };
            if cmp.store_conditional(Some(first)) {
                return;
            }
        }
    }

    pub fn pop(&self) -> Option<NonNull<T>> {
        let mut cmp = self.read();
        loop {
            let top = cmp.ptr()?;
            // SAFETY: items are never freed while linked into a stack; if
            // `top` was popped meanwhile, the generation check rejects us.
            let next = unsafe { top.as_ref().aba_next().load(Relaxed) };
            if cmp.store_conditional(NonNull::new(next)) {
                return Some(top);
            }
        }
    }

    /// Takes the whole stack, returning its former top.
    pub fn pop_all(&self) -> Option<NonNull<T>> {
        let mut cmp = self.read();
        loop {
            let top = cmp.ptr()?;
            if cmp.store_conditional(None) {
                return Some(top);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read().ptr().is_none()
    }
}

impl<T: AbaLinked> Default for AbaStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use core::{ptr::NonNull, sync::atomic::AtomicPtr};
    use std::{boxed::Box, collections::BTreeSet, sync::Arc, thread, vec::Vec};

    use super::*;

    struct Item {
        next: AtomicPtr<Item>,
        value: usize,
    }

    impl AbaLinked for Item {
        fn aba_next(&self) -> &AtomicPtr<Self> {
            &self.next
        }
    }

    fn leak(value: usize) -> NonNull<Item> {
        NonNull::from(Box::leak(Box::new(Item { next: AtomicPtr::default(), value })))
    }

    #[test]
    fn lifo() {
        let stack = AbaStack::<Item>::new();
        assert!(stack.pop().is_none());
        for i in 0..4 {
            unsafe { stack.push(leak(i)) };
        }
        let values: Vec<_> = core::iter::from_fn(|| stack.pop())
            .map(|p| unsafe { p.as_ref().value })
            .collect();
        assert_eq!(values, [3, 2, 1, 0]);
        assert!(stack.is_empty());
    }

    #[test]
    fn concurrent_push_pop() {
        const THREADS: usize = 4;
        const ITEMS: usize = 1000;

        let stack = Arc::new(AbaStack::<Item>::new());
        for i in 0..THREADS * ITEMS {
            unsafe { stack.push(leak(i)) };
        }
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let stack = stack.clone();
                thread::spawn(move || {
                    for _ in 0..ITEMS * 10 {
                        if let Some(item) = stack.pop() {
                            unsafe { stack.push(item) };
                        }
                    }
                })
            })
            .collect();
        handles.into_iter().for_each(|h| h.join().unwrap());

        let mut seen = BTreeSet::new();
        let mut top = stack.pop_all();
        while let Some(item) = top {
            let item = unsafe { item.as_ref() };
            assert!(seen.insert(item.value));
            top = NonNull::new(item.next.load(Relaxed));
        }
        assert_eq!(seen.len(), THREADS * ITEMS);
    }
}
