//! Entropy for the free list mitigations.

use crate::{config::Mitigations, pal::Pal};

/// The process-wide keys for free list obfuscation and signing, plus which
/// of the two protections are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeListKey {
    pub key1: usize,
    pub key2: usize,
    pub key_next: usize,
    pub forward: bool,
    pub backward: bool,
}

impl FreeListKey {
    /// Well-known keys, for builds that do not randomize and for the message
    /// queues' stub objects.
    pub const fn fixed(mitigations: Mitigations) -> Self {
        FreeListKey {
            key1: 0xdeadbeef,
            key2: 0xbeefdead,
            key_next: 0xdeadbeef,
            forward: mitigations.contains(Mitigations::FREELIST_FORWARD_EDGE),
            backward: mitigations.contains(Mitigations::FREELIST_BACKWARD_EDGE),
        }
    }

    /// Keys drawn from the platform's entropy source.
    ///
    /// `key1` and `key2` are forced odd so that a signature never collapses
    /// to zero for every input.
    pub fn random<P: Pal + ?Sized>(pal: &P, mitigations: Mitigations) -> Self {
        FreeListKey {
            key1: pal.entropy64() as usize | 1,
            key2: pal.entropy64() as usize | 1,
            key_next: pal.entropy64() as usize,
            ..Self::fixed(mitigations)
        }
    }

    /// The key of message queue links. Their second word carries message
    /// data, so they are only obfuscated, never signed.
    pub const fn for_queues(self) -> Self {
        FreeListKey { backward: false, ..self }
    }

    /// Whether free list links are transformed at all.
    #[inline]
    pub const fn is_plain(&self) -> bool {
        !self.forward && !self.backward
    }
}

#[inline]
const fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Per-allocator random numbers.
///
/// Not cryptographic: the stream only needs to be unpredictable to someone
/// who cannot read the allocator's own memory.
#[derive(Debug, Clone)]
pub struct LocalEntropy {
    key: u64,
    counter: u64,
    bit_source: u64,
    fresh_bits: u64,
    fresh_count: u32,
}

impl LocalEntropy {
    pub fn new<P: Pal + ?Sized>(pal: &P) -> Self {
        Self::with_seed(pal.entropy64(), pal.entropy64())
    }

    pub const fn with_seed(key: u64, counter: u64) -> Self {
        let bit_source = mix(counter.wrapping_add(key));
        LocalEntropy {
            key,
            counter: counter.wrapping_add(1),
            bit_source,
            fresh_bits: 0,
            fresh_count: 0,
        }
    }

    #[inline]
    pub fn next(&mut self) -> u64 {
        self.counter = self.counter.wrapping_add(0x9e37_79b9_7f4a_7c15);
        mix(self.counter ^ self.key)
    }

    /// The next bit of a 64-bit pattern that is reused, rotated, until
    /// [`refresh_bits`](Self::refresh_bits).
    ///
    /// Cheap enough for every free; the pattern is refreshed whenever a slab
    /// hands out its free list.
    #[inline]
    pub fn next_bit(&mut self) -> usize {
        let bit = self.bit_source & 1;
        self.bit_source = self.bit_source.rotate_right(1);
        bit as usize
    }

    pub fn refresh_bits(&mut self) {
        self.bit_source = self.next();
    }

    /// `n` bits that have never been handed out before.
    pub fn next_fresh_bits(&mut self, n: u32) -> u64 {
        debug_assert!(n > 0 && n < 64);
        if self.fresh_count < n {
            self.fresh_bits = self.next();
            self.fresh_count = 64;
        }
        let result = self.fresh_bits & ((1 << n) - 1);
        self.fresh_bits >>= n;
        self.fresh_count -= n;
        result
    }

    /// A uniformly distributed value in `0..bound`.
    pub fn sample(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        // Lemire's nearly-divisionless reduction.
        let mut m = (self.next() as u128) * (bound as u128);
        let mut low = m as u64;
        if low < bound as u64 {
            let threshold = (bound as u64).wrapping_neg() % bound as u64;
            while low < threshold {
                m = (self.next() as u128) * (bound as u128);
                low = m as u64;
            }
        }
        (m >> 64) as usize
    }
}
