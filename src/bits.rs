//! Power-of-two arithmetic and the fixed-point encoding used to derive size
//! classes.
//!
//! Everything here is `const fn` so the size-class tables can be computed at
//! compile time.

/// The number of bits in a machine word.
pub const BITS: usize = usize::BITS as usize;

#[inline]
pub const fn one_at_bit(shift: usize) -> usize {
    debug_assert!(shift < BITS);
    1 << shift
}

/// A mask of the `n` lowest bits.
#[inline]
pub const fn mask_bits(n: usize) -> usize {
    if n >= BITS { usize::MAX } else { (1 << n) - 1 }
}

#[inline]
pub const fn is_pow2(x: usize) -> bool {
    x != 0 && x & (x - 1) == 0
}

#[inline]
pub const fn clz(x: usize) -> usize {
    x.leading_zeros() as usize
}

#[inline]
pub const fn ctz(x: usize) -> usize {
    x.trailing_zeros() as usize
}

/// The exponent of the smallest power of two not less than `x`.
///
/// `next_pow2_bits(0) == next_pow2_bits(1) == 0`.
#[inline]
pub const fn next_pow2_bits(x: usize) -> usize {
    if x <= 1 { 0 } else { BITS - clz(x - 1) }
}

/// The smallest power of two not less than `x`.
///
/// `x` must not exceed `1 << (BITS - 1)`.
#[inline]
pub const fn next_pow2(x: usize) -> usize {
    one_at_bit(next_pow2_bits(x))
}

/// The largest power of two not greater than `x`, or 0 for 0.
#[inline]
pub const fn prev_pow2(x: usize) -> usize {
    if x == 0 { 0 } else { one_at_bit(BITS - 1 - clz(x)) }
}

#[inline]
pub const fn align_down(x: usize, align: usize) -> usize {
    debug_assert!(is_pow2(align));
    x & !(align - 1)
}

#[inline]
pub const fn align_up(x: usize, align: usize) -> usize {
    debug_assert!(is_pow2(align));
    (x + align - 1) & !(align - 1)
}

/// Like [`align_up`], but returns `None` on overflow.
#[inline]
pub const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
    debug_assert!(is_pow2(align));
    match x.checked_add(align - 1) {
        Some(x) => Some(x & !(align - 1)),
        None => None,
    }
}

#[inline]
pub const fn is_aligned(x: usize, align: usize) -> bool {
    x & (align - 1) == 0
}

#[inline]
pub const fn min(a: usize, b: usize) -> usize {
    if a < b { a } else { b }
}

#[inline]
pub const fn max(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

/// Encodes `value` as an exponent/mantissa pair.
///
/// `M` is the number of mantissa bits per octave and `L` the number of low
/// bits that are always rounded away. The result is the index of the smallest
/// representable value not less than `value`, so `from_exp_mant` of it is the
/// rounded-up value. `value` must be non-zero.
pub const fn to_exp_mant<const M: usize, const L: usize>(value: usize) -> usize {
    let leading = one_at_bit(M + L) >> 1;
    let mantissa_mask = mask_bits(M);

    let value = value - 1;
    let e = BITS - M - L - clz(value | leading);
    let b = (e != 0) as usize;
    let m = (value >> (L + e - b)) & mantissa_mask;
    (e << M) + m
}

/// The inverse of [`to_exp_mant`]: the value represented by index `m_e`.
pub const fn from_exp_mant<const M: usize, const L: usize>(m_e: usize) -> usize {
    if M == 0 {
        return one_at_bit(m_e + L);
    }
    let m_e = m_e + 1;
    let m = m_e & mask_bits(M);
    let e = m_e >> M;
    let b = (e != 0) as usize;
    (m + (b << M)) << (e - b + L)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow2() {
        assert_eq!(next_pow2(0), 1);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(4096), 4096);
        assert_eq!(next_pow2(4097), 8192);
        assert_eq!(next_pow2_bits(1 << 20), 20);
        assert_eq!(next_pow2_bits((1 << 20) + 1), 21);
        assert_eq!(prev_pow2(4097), 4096);
        assert_eq!(prev_pow2(0), 0);
        assert!(is_pow2(1 << 40));
        assert!(!is_pow2(0));
        assert!(!is_pow2(12));
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_down(17, 16), 16);
        assert_eq!(checked_align_up(usize::MAX - 3, 8), None);
        assert_eq!(mask_bits(0), 0);
        assert_eq!(mask_bits(BITS), usize::MAX);
    }

    #[test]
    fn exp_mant_sequence() {
        let sizes: [usize; 12] = [16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256];
        for (index, &size) in sizes.iter().enumerate() {
            assert_eq!(from_exp_mant::<2, 4>(index), size);
            assert_eq!(to_exp_mant::<2, 4>(size), index);
        }
    }

    #[test]
    fn exp_mant_rounds_up() {
        for value in 1..100_000usize {
            let index = to_exp_mant::<2, 4>(value);
            let rounded = from_exp_mant::<2, 4>(index);
            assert!(rounded >= value, "{value} rounded down to {rounded}");
            if index > 0 {
                assert!(from_exp_mant::<2, 4>(index - 1) < value);
            }
        }
    }
}
