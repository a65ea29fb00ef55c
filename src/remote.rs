//! Cross-thread deallocation.
//!
//! An object freed by a thread that does not own it travels back to its owner
//! inside a *ring*: a chain of free objects of one slab, linked with the
//! slab's own key and tweak so that the owner splices it into the slab's free
//! list in one step. The last object of the chain is the message. Its second
//! word packs where the chain starts and how long it is; its first word links
//! it into the owner's [`RemoteAllocator`] queue.
//!
//! Senders batch their frees in a [`RemoteDeallocCache`] and post them in
//! bulk. Messages that reach a heap they do not belong to, because several
//! destinations shared a cache slot, are forwarded on.

mod cache;
mod queue;

use core::ptr::NonNull;

pub use self::{cache::RemoteDeallocCache, queue::RemoteAllocator};
use crate::{
    bits,
    entropy::FreeListKey,
    error::Corruption,
    ptr::CapPtr,
    sizeclass::{self, SizeClass},
    slab::{FreePtr, freelist::signed_prev},
};

const LEN_SHIFT: usize = 16;
const INDEX_MASK: usize = (1 << LEN_SHIFT) - 1;

#[inline]
fn aux_mask(key: &FreeListKey, tweak: usize) -> usize {
    if key.forward { key.key_next ^ tweak } else { 0 }
}

/// The number of objects one slab of `sc` holds.
fn capacity(sc: SizeClass) -> usize {
    if sc.is_small() {
        sizeclass::sizeclass_to_slab_object_count(sc.as_small()) as usize
    } else {
        1
    }
}

/// Seals the chain `first ..= msg` of `len` objects of one slab into a
/// message carried by `msg`.
pub fn close_ring(first: FreePtr, msg: FreePtr, len: u16, sc: SizeClass, key: &FreeListKey, tweak: usize) {
    let index = sizeclass::slab_index(sc, first.addr());
    debug_assert!(index <= INDEX_MASK && len > 0);
    let word = (index | (len as usize) << LEN_SHIFT) ^ aux_mask(key, tweak);
    // SAFETY: `msg` is a tame free object.
    unsafe { msg.as_non_null().as_ref() }.set_aux(word);
}

/// The number of objects a message carries, read without opening it.
///
/// The result is unchecked; it only sizes capacity reservations.
pub fn ring_len(msg: FreePtr, key: &FreeListKey, tweak: usize) -> u16 {
    // SAFETY: `msg` is a tame free object.
    let word = unsafe { msg.as_non_null().as_ref() }.aux() ^ aux_mask(key, tweak);
    (word >> LEN_SHIFT) as u16
}

/// Reopens a message into the chain it was sealed from, returning its first
/// object and its length; `msg` is the last object.
///
/// The header is always bounds-checked against the slab. With backward-edge
/// protection or `checks`, the chain is walked too: every link must stay in
/// the slab, carry a valid signature, and the walk must end at `msg` after
/// exactly the announced number of steps. The walk also restores the
/// signature of `msg` that the header displaced.
pub fn open_ring(
    msg: FreePtr,
    sc: SizeClass,
    key: &FreeListKey,
    tweak: usize,
    checks: bool,
) -> Result<(FreePtr, u16), Corruption> {
    let bad = Corruption::BadMessage { addr: msg.addr() };
    // SAFETY: `msg` is a tame free object.
    let word = unsafe { msg.as_non_null().as_ref() }.aux() ^ aux_mask(key, tweak);
    let index = word & INDEX_MASK;
    let len = word >> LEN_SHIFT;
    let capacity = capacity(sc);
    if len == 0 || len > capacity || index >= capacity {
        return Err(bad);
    }

    let slab_size = sizeclass::sizeclass_full_to_slab_size(sc);
    let slab = bits::align_down(msg.addr(), slab_size);
    let first_addr = slab + index * sizeclass::sizeclass_full_to_size(sc);
    if len == 1 {
        return if first_addr == msg.addr() { Ok((msg, 1)) } else { Err(bad) };
    }
    let first = NonNull::new(msg.as_ptr().with_addr(first_addr)).ok_or(bad)?;
    // SAFETY: `first` is the start of an object of the same slab.
    let first: FreePtr = unsafe { CapPtr::new_tame(first) };
    if !(checks || key.backward) {
        return Ok((first, len as u16));
    }

    let in_slab = |addr: usize| addr.wrapping_sub(slab) < slab_size && sizeclass::is_start_of_object(sc, addr);
    let mut curr = first;
    for _ in 1..len {
        // SAFETY: `curr` is tame.
        let obj = unsafe { curr.as_non_null().as_ref() };
        let wild = obj.read_next(key, tweak).ok_or(bad)?;
        let addr = wild.addr();
        let next = wild.domesticate(in_slab).ok_or(Corruption::FreeListDomain { addr })?;
        // SAFETY: `next` was checked to be an object of the slab.
        let next_obj = unsafe { next.as_non_null().as_ref() };
        let signed = signed_prev(curr.addr(), next.addr(), key, tweak);
        if next == msg {
            if key.backward {
                next_obj.set_aux(signed);
            }
        } else {
            next_obj.check_prev(key, signed)?;
        }
        curr = next;
    }
    if curr != msg {
        return Err(bad);
    }
    Ok((first, len as u16))
}
