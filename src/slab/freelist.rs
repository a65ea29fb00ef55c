//! Hardened free lists.
//!
//! A free object stores two words: the encoded address of its successor and,
//! with backward-edge protection, a signature binding it to its predecessor.
//! Successors are XORed with a process-wide key and a per-slab tweak, so a
//! use-after-free write cannot redirect the list to a chosen address without
//! knowing the key. Every pointer read out of freed memory is domesticated
//! against the slab's bounds before it is followed.

use core::{
    cell::Cell,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering::*},
};

use crate::{
    aal,
    entropy::{FreeListKey, LocalEntropy},
    error::Corruption,
    ptr::{Alloc, CapPtr, Tame, Wild},
};

/// The tweak of lists that do not belong to one slab.
pub const NO_KEY_TWEAK: usize = 0;

pub type FreePtr = CapPtr<FreeObject, Alloc, Tame>;
pub type WildFreePtr = CapPtr<FreeObject, Alloc, Wild>;

/// The signature of the link `curr -> next`.
#[inline]
pub fn signed_prev(curr: usize, next: usize, key: &FreeListKey, tweak: usize) -> usize {
    curr.wrapping_add(key.key1)
        .wrapping_mul(next.wrapping_add(key.key2 ^ tweak))
}

#[inline]
fn code_next(next: usize, key: &FreeListKey, tweak: usize) -> usize {
    if key.forward { next ^ key.key_next ^ tweak } else { next }
}

#[inline]
fn decode(word: usize, key: &FreeListKey, tweak: usize) -> Option<WildFreePtr> {
    let addr = code_next(word, key, tweak);
    NonNull::new(core::ptr::with_exposed_provenance_mut::<FreeObject>(addr)).map(CapPtr::new_wild)
}

#[inline]
fn encode(next: Option<FreePtr>, key: &FreeListKey, tweak: usize) -> usize {
    let addr = next.map_or(0, |p| p.as_ptr().expose_provenance());
    code_next(addr, key, tweak)
}

/// The layout of a free object.
#[repr(C)]
pub struct FreeObject {
    next: AtomicUsize,
    prev: AtomicUsize,
}

const _: () = assert!(size_of::<FreeObject>() <= crate::sizeclass::MIN_ALLOC_SIZE);

impl Default for FreeObject {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeObject {
    /// An unlinked object, for sentinels living outside any slab.
    pub const fn new() -> Self {
        FreeObject { next: AtomicUsize::new(0), prev: AtomicUsize::new(0) }
    }

    /// Starts a free object at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a writable, unused object of at least
    /// [`MIN_ALLOC_SIZE`](crate::sizeclass::MIN_ALLOC_SIZE) bytes, owned by
    /// the allocator.
    #[inline]
    pub unsafe fn make(ptr: NonNull<u8>) -> FreePtr {
        let obj = ptr.cast::<FreeObject>();
        // SAFETY: see the contract.
        unsafe {
            obj.write(FreeObject::new());
            CapPtr::new_tame(obj)
        }
    }

    /// Reads and decodes the successor, without following it.
    #[inline]
    pub fn read_next(&self, key: &FreeListKey, tweak: usize) -> Option<WildFreePtr> {
        decode(self.next.load(Relaxed), key, tweak)
    }

    /// Like [`read_next`](Self::read_next), for links published to other
    /// threads with [`atomic_store_next`](Self::atomic_store_next).
    #[inline]
    pub fn atomic_read_next(&self, key: &FreeListKey, tweak: usize) -> Option<WildFreePtr> {
        decode(self.next.load(Acquire), key, tweak)
    }

    /// Checks the signature stored by the predecessor.
    #[inline]
    pub fn check_prev(&self, key: &FreeListKey, signed: usize) -> Result<(), Corruption> {
        if key.backward && self.prev.load(Relaxed) != signed {
            return Err(Corruption::FreeList);
        }
        Ok(())
    }

    /// Erases the list metadata before the object is handed out.
    #[inline]
    pub fn cleanup(&self, key: &FreeListKey) {
        if !key.is_plain() {
            self.next.store(0, Relaxed);
            self.prev.store(0, Relaxed);
        }
    }

    /// Stores `next` as the successor of the link slot at `curr`, signing it.
    ///
    /// `curr` is the address of the slot, which is either a builder's head
    /// or the first word of the predecessor.
    #[inline]
    pub fn store_next(curr: (&AtomicUsize, usize), next: FreePtr, key: &FreeListKey, tweak: usize) {
        if key.backward {
            // SAFETY: `next` is a tame free object.
            let n = unsafe { next.as_non_null().as_ref() };
            n.prev.store(signed_prev(curr.1, next.addr(), key, tweak), Relaxed);
        }
        curr.0.store(encode(Some(next), key, tweak), Relaxed);
    }

    #[inline]
    pub fn store_null(curr: &AtomicUsize, key: &FreeListKey, tweak: usize) {
        curr.store(encode(None, key, tweak), Relaxed)
    }

    /// Links `next` after `this`, signing the edge.
    #[inline]
    pub fn link(this: FreePtr, next: FreePtr, key: &FreeListKey, tweak: usize) {
        // SAFETY: `this` is a tame free object.
        let slot = unsafe { &this.as_non_null().as_ref().next };
        Self::store_next((slot, this.addr()), next, key, tweak)
    }

    /// Publishes `next` as the successor of `this` to a consumer thread.
    ///
    /// Only the successor is encoded: the second word of a queued object
    /// carries message data, so queue links are not signed.
    #[inline]
    pub fn atomic_store_next(this: FreePtr, next: Option<FreePtr>, key: &FreeListKey, tweak: usize) {
        // SAFETY: `this` is a tame free object.
        let obj = unsafe { this.as_non_null().as_ref() };
        obj.next.store(encode(next, key, tweak), Release);
    }

    #[inline]
    pub fn atomic_store_null(this: FreePtr, key: &FreeListKey, tweak: usize) {
        // SAFETY: `this` is a tame free object.
        let obj = unsafe { this.as_non_null().as_ref() };
        obj.next.store(encode(None, key, tweak), Relaxed);
    }

    /// The second word, used by message rings while the object is in flight.
    #[inline]
    pub fn aux(&self) -> usize {
        self.prev.load(Relaxed)
    }

    #[inline]
    pub fn set_aux(&self, value: usize) {
        self.prev.store(value, Relaxed)
    }
}

/// Follows a free list, checking every step.
#[derive(Debug, Clone, Copy)]
pub struct Iter {
    curr: Option<FreePtr>,
    prev: usize,
    tweak: usize,
}

impl Default for Iter {
    fn default() -> Self {
        Self::empty()
    }
}

impl Iter {
    pub const fn empty() -> Self {
        Iter { curr: None, prev: 0, tweak: NO_KEY_TWEAK }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.curr.is_none()
    }

    #[inline]
    pub fn peek(&self) -> Option<FreePtr> {
        self.curr
    }

    /// Takes the head object.
    ///
    /// The decoded successor is accepted only if `domesticate` approves its
    /// address, and the head's signature must match its predecessor.
    #[inline]
    pub fn take(
        &mut self,
        key: &FreeListKey,
        domesticate: impl FnOnce(usize) -> bool,
    ) -> Result<Option<FreePtr>, Corruption> {
        let Some(c) = self.curr else { return Ok(None) };
        // SAFETY: `c` was domesticated when it became the head.
        let obj = unsafe { c.as_non_null().as_ref() };
        let next = match obj.read_next(key, self.tweak) {
            None => None,
            Some(wild) => {
                let addr = wild.addr();
                Some(wild.domesticate(domesticate).ok_or(Corruption::FreeListDomain { addr })?)
            }
        };
        if let Some(next) = next {
            aal::prefetch(next.as_ptr());
        }
        self.curr = next;

        if key.backward {
            let signed = signed_prev(c.addr(), next.map_or(0, |n| n.addr()), key, self.tweak);
            let expected = core::mem::replace(&mut self.prev, signed);
            obj.check_prev(key, expected)?;
        }
        obj.cleanup(key);
        Ok(Some(c))
    }
}

/// Accumulates freed objects into (up to) two chains.
///
/// With `random-preserve`, each object goes to a chain picked by a random bit
/// and only the longer chain is handed out on [`close`](Builder::close),
/// which makes reuse order hard to predict.
///
/// The head slots are part of the signature of each chain's first link, so
/// a builder must not move while it holds objects.
pub struct Builder {
    head: [AtomicUsize; 2],
    end: [Cell<Option<FreePtr>>; 2],
    length: [Cell<u16>; 2],
    random: Cell<bool>,
}

// SAFETY: a builder is only ever accessed by the thread owning its slab.
unsafe impl Send for Builder {}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub const fn new() -> Self {
        Builder {
            head: [AtomicUsize::new(0), AtomicUsize::new(0)],
            end: [Cell::new(None), Cell::new(None)],
            length: [Cell::new(0), Cell::new(0)],
            random: Cell::new(false),
        }
    }

    pub fn init(&self, random: bool) {
        for i in 0..2 {
            self.head[i].store(0, Relaxed);
            self.end[i].set(None);
            self.length[i].set(0);
        }
        self.random.set(random);
    }

    fn slot(&self, index: usize) -> (&AtomicUsize, usize) {
        match self.end[index].get() {
            // SAFETY: the end of a chain is a tame free object.
            Some(end) => (unsafe { &end.as_non_null().as_ref().next }, end.addr()),
            None => (&self.head[index], self.head[index].as_ptr().addr()),
        }
    }

    #[inline]
    fn pick(&self, entropy: &mut LocalEntropy) -> usize {
        if self.random.get() { entropy.next_bit() } else { 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.end.iter().all(|end| end.get().is_none())
    }

    pub fn len(&self) -> usize {
        self.length.iter().map(|l| l.get() as usize).sum()
    }

    #[inline]
    pub fn add(&self, n: FreePtr, key: &FreeListKey, tweak: usize, entropy: &mut LocalEntropy) {
        let index = self.pick(entropy);
        FreeObject::store_next(self.slot(index), n, key, tweak);
        self.end[index].set(Some(n));
        self.length[index].set(self.length[index].get() + 1);
    }

    /// Appends an already linked chain of `len` objects.
    pub fn append_segment(
        &self,
        first: FreePtr,
        last: FreePtr,
        len: u16,
        key: &FreeListKey,
        tweak: usize,
        entropy: &mut LocalEntropy,
    ) {
        let index = self.pick(entropy);
        FreeObject::store_next(self.slot(index), first, key, tweak);
        self.end[index].set(Some(last));
        self.length[index].set(self.length[index].get() + len);
    }

    fn read_head(&self, index: usize, key: &FreeListKey, tweak: usize) -> Option<FreePtr> {
        // SAFETY: only objects stored by `add` or `append_segment` are
        // reachable from a head slot.
        decode(self.head[index].load(Relaxed), key, tweak).map(|p| unsafe { CapPtr::new_tame(p.as_non_null()) })
    }

    fn fake_signed_prev(&self, index: usize, key: &FreeListKey, tweak: usize) -> usize {
        let head = self.read_head(index, key, tweak).map_or(0, |p| p.addr());
        signed_prev(self.head[index].as_ptr().addr(), head, key, tweak)
    }

    /// Detaches the chain of a builder without randomness as a linked
    /// segment `(first, last, len)`. The successor of `last` is left unset.
    pub fn extract_segment(&self, key: &FreeListKey, tweak: usize) -> Option<(FreePtr, FreePtr, u16)> {
        debug_assert!(!self.random.get());
        let last = self.end[0].take()?;
        let first = self.read_head(0, key, tweak)?;
        let len = self.length[0].replace(0);
        self.head[0].store(0, Relaxed);
        Some((first, last, len))
    }

    /// Terminates one chain and turns it into an iterator, returning the
    /// number of objects left in the other chain.
    pub fn close(&self, key: &FreeListKey, tweak: usize) -> (Iter, u16) {
        let index = if self.random.get() && self.length[0].get() > self.length[1].get() {
            0
        } else if self.random.get() {
            1
        } else {
            0
        };
        let (slot, _) = self.slot(index);
        FreeObject::store_null(slot, key, tweak);

        let iter = if self.end[index].get().is_some() {
            Iter {
                curr: self.read_head(index, key, tweak),
                prev: self.fake_signed_prev(index, key, tweak),
                tweak,
            }
        } else {
            Iter { tweak, ..Iter::empty() }
        };
        self.end[index].set(None);
        self.length[index].set(0);
        (iter, self.length[1 - index].get())
    }

    /// Walks both chains, checking every signature and both lengths.
    pub fn validate(
        &self,
        key: &FreeListKey,
        tweak: usize,
        mut domesticate: impl FnMut(usize) -> bool,
    ) -> Result<(), Corruption> {
        for index in 0..2 {
            let Some(end) = self.end[index].get() else {
                if self.length[index].get() != 0 {
                    return Err(Corruption::FreeList);
                }
                continue;
            };
            let mut count = 1;
            let mut curr = self.read_head(index, key, tweak).ok_or(Corruption::FreeList)?;
            let mut prev = self.fake_signed_prev(index, key, tweak);
            loop {
                // SAFETY: `curr` is tame.
                let obj = unsafe { curr.as_non_null().as_ref() };
                obj.check_prev(key, prev)?;
                if curr == end {
                    break;
                }
                count += 1;
                let wild = obj.read_next(key, tweak).ok_or(Corruption::FreeList)?;
                let addr = wild.addr();
                let next = wild
                    .domesticate(&mut domesticate)
                    .ok_or(Corruption::FreeListDomain { addr })?;
                prev = signed_prev(curr.addr(), next.addr(), key, tweak);
                curr = next;
            }
            if count != self.length[index].get() {
                return Err(Corruption::FreeList);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;
    use std::{vec, vec::Vec};

    use super::*;
    use crate::config::Mitigations;

    const EDGES: Mitigations = Mitigations::FREELIST_FORWARD_EDGE.union(Mitigations::FREELIST_BACKWARD_EDGE);

    struct Slab {
        memory: Vec<[usize; 4]>,
    }

    impl Slab {
        fn new(count: usize) -> Self {
            Slab { memory: vec![[0; 4]; count] }
        }

        fn obj(&mut self, index: usize) -> FreePtr {
            unsafe { FreeObject::make(NonNull::from(&mut self.memory[index]).cast()) }
        }

        fn contains(&self) -> impl Fn(usize) -> bool + Copy + use<> {
            let start = self.memory.as_ptr().addr();
            let end = start + self.memory.len() * 32;
            move |addr| (start..end).contains(&addr)
        }
    }

    #[test]
    fn link_coding_is_an_involution() {
        let mut rng = fastrand::Rng::with_seed(3);
        for mitigations in [Mitigations::NONE, Mitigations::FREELIST_FORWARD_EDGE, EDGES] {
            let key = FreeListKey {
                key1: rng.usize(..),
                key2: rng.usize(..),
                key_next: rng.usize(..),
                ..FreeListKey::fixed(mitigations)
            };
            for _ in 0..1000 {
                let (next, tweak) = (rng.usize(..), rng.usize(..));
                let coded = code_next(next, &key, tweak);
                assert_eq!(code_next(coded, &key, tweak), next);
                if !key.forward {
                    assert_eq!(coded, next);
                }
            }
            assert_eq!(decode(encode(None, &key, 5), &key, 5).map(|p| p.addr()), None);
        }
    }

    fn drain(iter: &mut Iter, key: &FreeListKey, check: impl Fn(usize) -> bool + Copy) -> Vec<usize> {
        let mut out = Vec::new();
        while let Some(p) = iter.take(key, check).unwrap() {
            out.push(p.addr());
        }
        out
    }

    #[test]
    fn fifo_without_randomness() {
        let mut slab = Slab::new(8);
        let key = FreeListKey::fixed(EDGES);
        let mut entropy = LocalEntropy::with_seed(1, 1);
        let builder = Builder::new();
        builder.init(false);
        let tweak = 0x1234;

        let objs: Vec<_> = (0..8).map(|i| slab.obj(i)).collect();
        for &o in &objs {
            builder.add(o, &key, tweak, &mut entropy);
        }
        assert_eq!(builder.len(), 8);
        builder.validate(&key, tweak, slab.contains()).unwrap();

        let (mut iter, remaining) = builder.close(&key, tweak);
        assert_eq!(remaining, 0);
        assert!(builder.is_empty());
        let out = drain(&mut iter, &key, slab.contains());
        assert_eq!(out, objs.iter().map(|o| o.addr()).collect::<Vec<_>>());
    }

    #[test]
    fn random_preserve_splits() {
        let mut slab = Slab::new(64);
        let key = FreeListKey::fixed(EDGES);
        let mut entropy = LocalEntropy::with_seed(7, 9);
        let builder = Builder::new();
        builder.init(true);

        for i in 0..64 {
            let o = slab.obj(i);
            builder.add(o, &key, 0, &mut entropy);
        }
        builder.validate(&key, 0, slab.contains()).unwrap();
        let (mut iter, remaining) = builder.close(&key, 0);
        let out = drain(&mut iter, &key, slab.contains());
        assert_eq!(out.len() + remaining as usize, 64);
        assert!(out.len() >= remaining as usize);
        assert_eq!(builder.len(), remaining as usize);
    }

    #[test]
    fn forged_successor_is_rejected() {
        let mut slab = Slab::new(4);
        let key = FreeListKey::fixed(EDGES);
        let mut entropy = LocalEntropy::with_seed(1, 1);
        let builder = Builder::new();
        builder.init(false);
        for i in 0..4 {
            let o = slab.obj(i);
            builder.add(o, &key, 5, &mut entropy);
        }
        let (mut iter, _) = builder.close(&key, 5);

        // A use-after-free write of a plain pointer into the first object.
        slab.memory[0][0] = slab.memory[2].as_ptr().addr();
        let check = slab.contains();
        let err = loop {
            match iter.take(&key, check) {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("corruption went unnoticed"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, Corruption::FreeList | Corruption::FreeListDomain { .. }));
    }

    #[test]
    fn segments_keep_signatures() {
        let mut slab = Slab::new(6);
        let key = FreeListKey::fixed(EDGES);
        let mut entropy = LocalEntropy::with_seed(1, 1);
        let tweak = 77;
        let objs: Vec<_> = (0..6).map(|i| slab.obj(i)).collect();
        for pair in objs[1..4].windows(2) {
            FreeObject::link(pair[0], pair[1], &key, tweak);
        }

        let builder = Builder::new();
        builder.init(false);
        builder.add(objs[0], &key, tweak, &mut entropy);
        builder.append_segment(objs[1], objs[3], 3, &key, tweak, &mut entropy);
        builder.add(objs[5], &key, tweak, &mut entropy);
        builder.validate(&key, tweak, slab.contains()).unwrap();

        let (mut iter, _) = builder.close(&key, tweak);
        let out = drain(&mut iter, &key, slab.contains());
        let expected: Vec<_> = [0, 1, 2, 3, 5].iter().map(|&i| objs[i].addr()).collect();
        assert_eq!(out, expected);
    }
}
