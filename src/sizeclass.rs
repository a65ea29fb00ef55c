//! Size classes.
//!
//! Small requests are rounded up to one of [`NUM_SMALL_SIZECLASSES`] sizes
//! spaced `2^INTERMEDIATE_BITS` per power of two. Everything larger is a
//! power-of-two sized chunk. Both kinds share one tagged representation,
//! [`SizeClass`], which is what the pagemap records for every chunk.
//!
//! Division by an object size is replaced by multiplication with a
//! precomputed reciprocal, validated exhaustively by the tests below.

use core::fmt;

use crate::{
    aal::ADDRESS_BITS,
    bits::{self, BITS},
    config::{
        INTERMEDIATE_BITS, MAX_SMALL_SIZECLASS_BITS, MIN_CHUNK_BITS, MIN_OBJECT_COUNT,
        Mitigations, WAKE_THRESHOLD_CAP,
    },
};

/// The smallest object: room for a free list link and its signature.
pub const MIN_ALLOC_SIZE: usize = 2 * size_of::<usize>();
pub const MIN_ALLOC_STEP_BITS: usize = bits::ctz(MIN_ALLOC_SIZE);
pub const MIN_ALLOC_STEP_SIZE: usize = bits::one_at_bit(MIN_ALLOC_STEP_BITS);

pub const MIN_CHUNK_SIZE: usize = bits::one_at_bit(MIN_CHUNK_BITS);
pub const MAX_SMALL_SIZECLASS_SIZE: usize = bits::one_at_bit(MAX_SMALL_SIZECLASS_BITS);

pub const NUM_SMALL_SIZECLASSES: usize =
    bits::to_exp_mant::<{ INTERMEDIATE_BITS }, { MIN_ALLOC_STEP_BITS }>(MAX_SMALL_SIZECLASS_SIZE)
        + 1;
pub const NUM_LARGE_CLASSES: usize = ADDRESS_BITS - MAX_SMALL_SIZECLASS_BITS;

const TAG_BITS: usize = bits::max(
    bits::next_pow2_bits(NUM_SMALL_SIZECLASSES),
    bits::next_pow2_bits(NUM_LARGE_CLASSES + 1),
);
/// Set in the representation of every small size class.
pub const TAG: usize = bits::one_at_bit(TAG_BITS);
/// The number of distinct [`SizeClass`] representations.
pub const SIZECLASS_REP_SIZE: usize = bits::one_at_bit(TAG_BITS + 1);

/// The alignment of every allocator's message queue.
///
/// A queue address and a size class are packed in one pagemap word, with one
/// more bit left for the backend-ownership marker.
pub const REMOTE_MIN_ALIGN: usize = bits::max(SIZECLASS_REP_SIZE << 1, crate::aal::CACHELINE_SIZE);

const _: () = {
    assert!(MIN_ALLOC_SIZE >= 2 * size_of::<usize>());
    assert!(MIN_CHUNK_BITS <= MAX_SMALL_SIZECLASS_BITS + 4);
    assert!(NUM_SMALL_SIZECLASSES < TAG);
    // Large classes are `BITS - bits` for `bits >= 1`.
    assert!(BITS <= TAG);
};

/// A small or large size class, tagged.
///
/// The all-zero value is the "large" class of size 0, recorded for memory
/// the allocator does not own.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SizeClass(usize);

impl SizeClass {
    pub const UNOWNED: Self = SizeClass(0);

    #[inline]
    pub const fn from_small(sc: usize) -> Self {
        debug_assert!(sc < TAG);
        SizeClass(TAG + sc)
    }

    /// The class of a chunk of `2^bits` bytes.
    #[inline]
    pub const fn from_large_bits(bits: usize) -> Self {
        debug_assert!(bits > 0 && bits <= BITS);
        SizeClass(BITS - bits)
    }

    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        debug_assert!(raw < SIZECLASS_REP_SIZE);
        SizeClass(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_small(self) -> bool {
        self.0 & TAG != 0
    }

    #[inline]
    pub const fn is_unowned(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn as_small(self) -> usize {
        debug_assert!(self.is_small());
        self.0 & (TAG - 1)
    }

    /// The log2 of the chunk size of a large class.
    #[inline]
    pub const fn as_large_bits(self) -> usize {
        debug_assert!(!self.is_small());
        BITS - (self.0 & (TAG - 1))
    }
}

impl fmt::Debug for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_small() {
            write!(f, "Small({}: {}B)", self.as_small(), sizeclass_to_size(self.as_small()))
        } else if self.is_unowned() {
            f.write_str("Unowned")
        } else {
            write!(f, "Large(2^{})", self.as_large_bits())
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Fast {
    size: usize,
    slab_mask: usize,
    div_mult: usize,
    mod_zero_mult: usize,
}

#[derive(Debug, Clone, Copy)]
struct Slow {
    capacity: u16,
    waking: u16,
}

struct Table {
    fast: [Fast; SIZECLASS_REP_SIZE],
    slow: [Slow; SIZECLASS_REP_SIZE],
    div_mult_shift: usize,
}

impl Table {
    const fn new() -> Self {
        let mut fast = [Fast { size: 0, slab_mask: 0, div_mult: 0, mod_zero_mult: 0 }; SIZECLASS_REP_SIZE];
        let mut slow = [Slow { capacity: 0, waking: 0 }; SIZECLASS_REP_SIZE];

        let mut max_capacity = 0;
        let mut sc = 0;
        while sc < NUM_SMALL_SIZECLASSES {
            let index = SizeClass::from_small(sc).raw();
            let size = bits::from_exp_mant::<{ INTERMEDIATE_BITS }, { MIN_ALLOC_STEP_BITS }>(sc);
            let slab_bits = bits::max(bits::next_pow2_bits(MIN_OBJECT_COUNT * size), MIN_CHUNK_BITS);
            fast[index].size = size;
            fast[index].slab_mask = bits::mask_bits(slab_bits);

            let capacity = (fast[index].slab_mask + 1) / size;
            assert!(capacity <= u16::MAX as usize);
            slow[index].capacity = capacity as u16;
            slow[index].waking = capacity as u16 / 4;
            if capacity > max_capacity {
                max_capacity = capacity;
            }
            sc += 1;
        }

        let div_mult_shift = BITS - bits::next_pow2_bits(max_capacity);
        let mut sc = 0;
        while sc < NUM_SMALL_SIZECLASSES {
            let meta = &mut fast[SizeClass::from_small(sc).raw()];
            meta.div_mult = bits::mask_bits(div_mult_shift) / meta.size + 1;
            meta.mod_zero_mult = !0 / meta.size + 1;
            sc += 1;
        }

        let mut raw = 0;
        while raw < BITS {
            let meta = &mut fast[raw];
            meta.size = if raw == 0 { 0 } else { bits::one_at_bit(BITS - raw) };
            meta.slab_mask = meta.size.wrapping_sub(1);
            meta.mod_zero_mult = 1;
            meta.div_mult = 0;
            raw += 1;
        }

        Table { fast, slow, div_mult_shift }
    }

    #[inline]
    const fn fast(&self, sc: SizeClass) -> &Fast {
        &self.fast[sc.raw()]
    }

    #[inline]
    const fn slow(&self, sc: usize) -> &Slow {
        &self.slow[SizeClass::from_small(sc).raw()]
    }
}

static TABLE: Table = Table::new();

/// The shift applied after multiplying by a class's reciprocal.
pub const DIV_MULT_SHIFT: usize = Table::new().div_mult_shift;

const fn lookup_index(size: usize) -> usize {
    (size - 1) >> MIN_ALLOC_STEP_BITS
}

const LOOKUP_SIZE: usize = lookup_index(MAX_SMALL_SIZECLASS_SIZE) + 1;

static LOOKUP: [u8; LOOKUP_SIZE] = {
    let mut table = [0u8; LOOKUP_SIZE];
    let minimum = bits::to_exp_mant::<{ INTERMEDIATE_BITS }, { MIN_ALLOC_STEP_BITS }>(MIN_ALLOC_SIZE);
    let mut curr = 1;
    let mut sc = 0;
    while sc < NUM_SMALL_SIZECLASSES {
        let size = bits::from_exp_mant::<{ INTERMEDIATE_BITS }, { MIN_ALLOC_STEP_BITS }>(sc);
        while curr <= size {
            let index = lookup_index(curr);
            if index == LOOKUP_SIZE {
                break;
            }
            table[index] = if sc < minimum { minimum as u8 } else { sc as u8 };
            curr += MIN_ALLOC_STEP_SIZE;
        }
        sc += 1;
    }
    table
};

/// Whether `size` is served from a slab. Zero is not.
#[inline]
pub const fn is_small_sizeclass(size: usize) -> bool {
    size.wrapping_sub(1) < MAX_SMALL_SIZECLASS_SIZE
}

/// The small class of `size`, or 0 for sizes that are not small.
#[inline]
pub fn size_to_sizeclass(size: usize) -> usize {
    if is_small_sizeclass(size) {
        return LOOKUP[lookup_index(size)] as usize;
    }
    0
}

#[inline]
pub fn size_to_sizeclass_full(size: usize) -> SizeClass {
    if is_small_sizeclass(size) {
        return SizeClass::from_small(size_to_sizeclass(size));
    }
    SizeClass::from_raw(bits::clz(size.wrapping_sub(1)))
}

#[inline]
pub fn sizeclass_to_size(sc: usize) -> usize {
    TABLE.fast(SizeClass::from_small(sc)).size
}

#[inline]
pub fn sizeclass_full_to_size(sc: SizeClass) -> usize {
    TABLE.fast(sc).size
}

#[inline]
pub fn sizeclass_to_slab_size(sc: usize) -> usize {
    TABLE.fast(SizeClass::from_small(sc)).slab_mask + 1
}

#[inline]
pub fn sizeclass_full_to_slab_size(sc: SizeClass) -> usize {
    TABLE.fast(sc).slab_mask.wrapping_add(1)
}

#[inline]
pub fn sizeclass_to_slab_object_count(sc: usize) -> u16 {
    TABLE.slow(sc).capacity
}

/// The number of frees a sleeping slab of class `sc` waits for before it is
/// reused.
#[inline]
pub fn threshold_for_waking(sc: usize, mitigations: Mitigations) -> u16 {
    let quarter = TABLE.slow(sc).waking;
    if mitigations.contains(Mitigations::RANDOM_LARGER_THRESHOLDS) {
        quarter
    } else {
        quarter.min(WAKE_THRESHOLD_CAP as u16)
    }
}

/// The index of the object containing `addr` within its slab.
#[inline]
pub fn slab_index(sc: SizeClass, addr: usize) -> usize {
    let meta = TABLE.fast(sc);
    let offset = addr & meta.slab_mask;
    if cfg!(target_pointer_width = "64") {
        offset.wrapping_mul(meta.div_mult) >> DIV_MULT_SHIFT
    } else if meta.size == 0 {
        0
    } else {
        offset / meta.size
    }
}

#[inline]
pub fn start_of_object(sc: SizeClass, addr: usize) -> usize {
    let meta = TABLE.fast(sc);
    let slab_start = addr & !meta.slab_mask;
    slab_start + slab_index(sc, addr) * meta.size
}

#[inline]
pub fn index_in_object(sc: SizeClass, addr: usize) -> usize {
    addr - start_of_object(sc, addr)
}

/// The bytes from `addr` to the end of its object.
///
/// For [`SizeClass::UNOWNED`] this is the distance to the end of the address
/// space, i.e. unbounded.
#[inline]
pub fn remaining_bytes(sc: SizeClass, addr: usize) -> usize {
    TABLE.fast(sc).size.wrapping_sub(index_in_object(sc, addr))
}

#[inline]
pub fn is_start_of_object(sc: SizeClass, addr: usize) -> bool {
    let meta = TABLE.fast(sc);
    let offset = addr & meta.slab_mask;
    if cfg!(target_pointer_width = "64") {
        offset.wrapping_mul(meta.mod_zero_mult) < meta.mod_zero_mult
    } else {
        meta.size == 0 || offset % meta.size == 0
    }
}

/// The size actually provided for a request of `size` bytes.
#[inline]
pub fn round_size(size: usize) -> usize {
    if is_small_sizeclass(size) {
        return sizeclass_to_size(size_to_sizeclass(size));
    }
    if size == 0 {
        return sizeclass_to_size(size_to_sizeclass(1));
    }
    if size > bits::one_at_bit(BITS - 1) {
        return size;
    }
    bits::next_pow2(size)
}

/// The alignment every allocation of `size` bytes is guaranteed to have.
#[inline]
pub fn natural_alignment(size: usize) -> usize {
    if size == 0 {
        return 1;
    }
    bits::one_at_bit(bits::ctz(round_size(size)))
}

/// The request size that satisfies both `align` and `size`, relying on the
/// natural alignment of every class.
///
/// Returns `usize::MAX` when the computation overflows, which no allocation
/// can satisfy.
#[inline]
pub const fn aligned_size(align: usize, size: usize) -> usize {
    debug_assert!(bits::is_pow2(align));
    let result = ((align - 1) | size.wrapping_sub(1)).wrapping_add(1);
    if result == 0 && size > 0 {
        return usize::MAX;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_sizes() {
        assert_eq!(MIN_ALLOC_SIZE, 16);
        assert_eq!(NUM_SMALL_SIZECLASSES, 44);
        assert_eq!(TAG, 64);
        assert_eq!(SIZECLASS_REP_SIZE, 128);
        assert_eq!(REMOTE_MIN_ALIGN, 256);

        let expected = [16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
        for (sc, &size) in expected.iter().enumerate() {
            assert_eq!(sizeclass_to_size(sc), size);
        }
        assert_eq!(sizeclass_to_size(NUM_SMALL_SIZECLASSES - 1), MAX_SMALL_SIZECLASS_SIZE);
    }

    #[test]
    fn large_classes_stay_untagged() {
        // On 64-bit targets the tag bit equals the word width.
        assert!(BITS <= TAG);
        for bits in 1..=BITS {
            let sc = SizeClass::from_large_bits(bits);
            assert!(!sc.is_small(), "{bits}");
            assert_eq!(sc.as_large_bits(), bits);
        }
        assert!(SizeClass::from_small(NUM_SMALL_SIZECLASSES - 1).is_small());
    }

    #[test]
    fn lookup_rounds_up() {
        assert_eq!(size_to_sizeclass(0), 0);
        let mut prev = 0;
        for size in 1..=MAX_SMALL_SIZECLASS_SIZE {
            let sc = size_to_sizeclass(size);
            let rounded = sizeclass_to_size(sc);
            assert!(rounded >= size, "{size} -> {rounded}");
            assert!(sc == 0 || sizeclass_to_size(sc - 1) < size);
            assert!(sc >= prev);
            prev = sc;
        }
    }

    #[test]
    fn large_classes() {
        let sc = size_to_sizeclass_full(MAX_SMALL_SIZECLASS_SIZE + 1);
        assert!(!sc.is_small());
        assert_eq!(sc.as_large_bits(), MAX_SMALL_SIZECLASS_BITS + 1);
        assert_eq!(sc, SizeClass::from_large_bits(MAX_SMALL_SIZECLASS_BITS + 1));
        assert_eq!(sizeclass_full_to_size(sc), MAX_SMALL_SIZECLASS_SIZE * 2);
        assert_eq!(sizeclass_full_to_slab_size(sc), MAX_SMALL_SIZECLASS_SIZE * 2);

        assert!(size_to_sizeclass_full(0).is_unowned());
        assert_eq!(sizeclass_full_to_size(SizeClass::UNOWNED), 0);

        let chunk = 1usize << 20;
        let sc = SizeClass::from_large_bits(20);
        assert_eq!(start_of_object(sc, chunk + 12345), chunk);
        assert_eq!(remaining_bytes(sc, chunk + 12345), chunk - 12345);
        assert!(is_start_of_object(sc, chunk));
        assert!(!is_start_of_object(sc, chunk + 16));
    }

    #[test]
    fn unowned_is_unbounded() {
        let addr = 0x7f00_0000_1234usize;
        assert_eq!(remaining_bytes(SizeClass::UNOWNED, addr), addr.wrapping_neg());
        assert!(remaining_bytes(SizeClass::UNOWNED, addr) > 1 << 40);
    }

    #[test]
    fn reciprocals_are_exact() {
        let base = 1usize << 32;
        for sc in 0..NUM_SMALL_SIZECLASSES {
            let full = SizeClass::from_small(sc);
            let size = sizeclass_to_size(sc);
            let slab = sizeclass_to_slab_size(sc);
            let count = sizeclass_to_slab_object_count(sc) as usize;
            assert_eq!(count, slab / size);
            assert!(count >= MIN_OBJECT_COUNT);

            for offset in 0..slab {
                let addr = base + offset;
                assert_eq!(slab_index(full, addr), offset / size, "class {sc} offset {offset}");
                assert_eq!(is_start_of_object(full, addr), offset % size == 0);
            }
            let last = base + slab - 1;
            assert_eq!(start_of_object(full, last), base + (slab - 1) / size * size);
            assert_eq!(remaining_bytes(full, base + size + 3), size - 3);
            assert_eq!(index_in_object(full, base + size + 3), 3);
        }
    }

    #[test]
    fn waking_thresholds() {
        for sc in 0..NUM_SMALL_SIZECLASSES {
            let capacity = sizeclass_to_slab_object_count(sc);
            let capped = threshold_for_waking(sc, Mitigations::NONE);
            let larger = threshold_for_waking(sc, Mitigations::RANDOM_LARGER_THRESHOLDS);
            assert_eq!(larger, capacity / 4);
            assert_eq!(capped, (capacity / 4).min(WAKE_THRESHOLD_CAP as u16));
            assert!(capped > 0);
        }
    }

    #[test]
    fn rounding_and_alignment() {
        assert_eq!(round_size(0), 16);
        assert_eq!(round_size(1), 16);
        assert_eq!(round_size(17), 32);
        assert_eq!(round_size(MAX_SMALL_SIZECLASS_SIZE + 1), MAX_SMALL_SIZECLASS_SIZE * 2);
        assert_eq!(round_size(usize::MAX), usize::MAX);

        assert_eq!(natural_alignment(0), 1);
        assert_eq!(natural_alignment(48), 16);
        assert_eq!(natural_alignment(64), 64);
        assert_eq!(natural_alignment(100_000), 1 << 17);

        assert_eq!(aligned_size(64, 24), 64);
        assert_eq!(aligned_size(8, 24), 24);
        assert_eq!(aligned_size(4096, 0), 0);
        assert_eq!(aligned_size(1 << 20, usize::MAX - 5), usize::MAX);
        for align in (0..20).map(|b| 1usize << b) {
            for size in [1, 7, 100, 5000, 70_000] {
                let rounded = round_size(aligned_size(align, size));
                assert!(rounded >= size);
                assert_eq!(rounded % align, 0, "align {align} size {size}");
            }
        }
    }
}
