//! Slabs: chunks subdivided into objects of one size class.
//!
//! The free objects of a slab are threaded into hardened free lists
//! ([`freelist`]); the state of each slab lives apart from the slab itself in
//! a [`SlabMetadata`], which the owning heap files into intrusive
//! [`SlabList`]s.

pub mod freelist;
mod list;
mod meta;

pub use self::{
    freelist::{Builder, FreeObject, FreePtr, Iter},
    list::{SlabLink, SlabLinked, SlabList},
    meta::SlabMetadata,
};
