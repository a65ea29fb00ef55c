//! Build-time tunables and hardening configuration.
//!
//! The numeric constants are generated by the build script and may be
//! overridden at build time by setting `PA_<NAME>` in the environment, e.g.
//! `PA_REMOTE_BATCH_LIMIT=65536`.

use core::fmt;

include!(concat!(env!("OUT_DIR"), "/config.rs"));

/// A set of hardening mitigations.
///
/// Cargo features select [`DEFAULT_MITIGATIONS`]; a
/// [`Globals`](crate::globals::Globals) instance resolves its own set once on
/// construction and every component reads it from there.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mitigations(u32);

/// The documentation of one mitigation flag.
#[derive(Debug, Clone, Copy)]
pub struct MitigationInfo {
    pub flag: Mitigations,
    pub name: &'static str,
    pub effect: &'static str,
}

impl Mitigations {
    pub const NONE: Self = Mitigations(0);
    pub const RANDOM_INITIAL: Self = Mitigations(1 << 0);
    pub const RANDOM_PRESERVE: Self = Mitigations(1 << 1);
    pub const RANDOM_EXTRA_SLAB: Self = Mitigations(1 << 2);
    pub const RANDOM_LARGER_THRESHOLDS: Self = Mitigations(1 << 3);
    pub const REUSE_LIFO: Self = Mitigations(1 << 4);
    pub const FREELIST_FORWARD_EDGE: Self = Mitigations(1 << 5);
    pub const FREELIST_BACKWARD_EDGE: Self = Mitigations(1 << 6);
    pub const SANITY_CHECKS: Self = Mitigations(1 << 7);
    pub const METADATA_PROTECTION: Self = Mitigations(1 << 8);
    pub const RANDOM_PAGEMAP: Self = Mitigations(1 << 9);
    pub const PAL_ENFORCE_ACCESS: Self = Mitigations(1 << 10);

    /// Every mitigation except `reuse-lifo`, which only changes reuse order.
    pub const HARDENED: Self = Mitigations(0x7ff & !Self::REUSE_LIFO.0);

    /// The flags documented as `{flag: effect}`.
    pub const INFO: &'static [MitigationInfo] = &[
        MitigationInfo {
            flag: Self::RANDOM_INITIAL,
            name: "random-initial",
            effect: "new slabs build their free list in a random cyclic order",
        },
        MitigationInfo {
            flag: Self::RANDOM_PRESERVE,
            name: "random-preserve",
            effect: "freed objects are split randomly between two chains and only the longer one is reused",
        },
        MitigationInfo {
            flag: Self::RANDOM_EXTRA_SLAB,
            name: "random-extra-slab",
            effect: "a fresh slab is occasionally used even though a cached one is available",
        },
        MitigationInfo {
            flag: Self::RANDOM_LARGER_THRESHOLDS,
            name: "random-larger-thresholds",
            effect: "sleeping slabs wait for a quarter of their capacity to be freed, uncapped",
        },
        MitigationInfo {
            flag: Self::REUSE_LIFO,
            name: "reuse-lifo",
            effect: "cached slabs are reused most recent first instead of oldest first",
        },
        MitigationInfo {
            flag: Self::FREELIST_FORWARD_EDGE,
            name: "freelist-forward-edge",
            effect: "free list successors are obfuscated with a per-process key and per-slab tweak",
        },
        MitigationInfo {
            flag: Self::FREELIST_BACKWARD_EDGE,
            name: "freelist-backward-edge",
            effect: "every free list link is signed and the signature is checked on traversal",
        },
        MitigationInfo {
            flag: Self::SANITY_CHECKS,
            name: "sanity-checks",
            effect: "deallocations validate object starts, ownership, list domains and message bounds",
        },
        MitigationInfo {
            flag: Self::METADATA_PROTECTION,
            name: "metadata-protection",
            effect: "slab metadata lives in address space disjoint from client objects",
        },
        MitigationInfo {
            flag: Self::RANDOM_PAGEMAP,
            name: "random-pagemap",
            effect: "the pagemap directory is placed at a random offset of a larger reservation",
        },
        MitigationInfo {
            flag: Self::PAL_ENFORCE_ACCESS,
            name: "pal-enforce-access",
            effect: "reserved memory is inaccessible until committed and again after decommit",
        },
    ];

    /// The set selected by the enabled Cargo features.
    pub const fn from_features() -> Self {
        let mut bits = 0;
        if cfg!(feature = "random-initial") {
            bits |= Self::RANDOM_INITIAL.0;
        }
        if cfg!(feature = "random-preserve") {
            bits |= Self::RANDOM_PRESERVE.0;
        }
        if cfg!(feature = "random-extra-slab") {
            bits |= Self::RANDOM_EXTRA_SLAB.0;
        }
        if cfg!(feature = "random-larger-thresholds") {
            bits |= Self::RANDOM_LARGER_THRESHOLDS.0;
        }
        if cfg!(feature = "reuse-lifo") {
            bits |= Self::REUSE_LIFO.0;
        }
        if cfg!(feature = "freelist-forward-edge") {
            bits |= Self::FREELIST_FORWARD_EDGE.0;
        }
        if cfg!(feature = "freelist-backward-edge") {
            bits |= Self::FREELIST_BACKWARD_EDGE.0;
        }
        if cfg!(feature = "sanity-checks") {
            bits |= Self::SANITY_CHECKS.0;
        }
        if cfg!(feature = "metadata-protection") {
            bits |= Self::METADATA_PROTECTION.0;
        }
        if cfg!(feature = "random-pagemap") {
            bits |= Self::RANDOM_PAGEMAP.0;
        }
        if cfg!(feature = "pal-enforce-access") {
            bits |= Self::PAL_ENFORCE_ACCESS.0;
        }
        Mitigations(bits)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Mitigations(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Mitigations(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether any of the free list randomisations is on.
    #[inline]
    pub const fn randomises_free_lists(self) -> bool {
        self.0 & (Self::RANDOM_INITIAL.0 | Self::RANDOM_PRESERVE.0) != 0
    }

    /// The documentation of every flag in this set.
    pub fn iter(self) -> impl Iterator<Item = &'static MitigationInfo> {
        Self::INFO.iter().filter(move |info| self.contains(info.flag))
    }
}

impl Default for Mitigations {
    fn default() -> Self {
        DEFAULT_MITIGATIONS
    }
}

impl fmt::Debug for Mitigations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|info| info.name)).finish()
    }
}

impl fmt::Display for Mitigations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        for (index, info) in self.iter().enumerate() {
            if index > 0 {
                f.write_str("|")?;
            }
            f.write_str(info.name)?;
        }
        Ok(())
    }
}

pub const DEFAULT_MITIGATIONS: Mitigations = Mitigations::from_features();
