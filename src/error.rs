//! The errors of this crate.

use thiserror::Error;

/// Heap corruption detected by one of the sanity checks.
///
/// Every variant is fatal: once observed, the allocator reports it through
/// the platform's error path and aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Corruption {
    #[error("heap corruption: free list corrupted")]
    FreeList,
    #[error("heap corruption: free list entry {addr:#x} escapes its slab")]
    FreeListDomain { addr: usize },
    #[error("deallocating {addr:#x}, which is not the start of an object")]
    NotStartOfObject { addr: usize },
    #[error("deallocating {addr:#x}, which is not owned by the allocator")]
    NotOwned { addr: usize },
    #[error("deallocating {addr:#x}, which is owned by the backend")]
    BackendOwned { addr: usize },
    #[error("double free of {addr:#x}")]
    DoubleFree { addr: usize },
    #[error("allocator is not empty on teardown")]
    SlabNotEmpty,
    #[error("malformed remote message at {addr:#x}")]
    BadMessage { addr: usize },
    #[error("copy of {len} bytes overflows the heap allocation at {addr:#x}")]
    CopyOverflow { addr: usize, len: usize },
    #[error("deallocating {addr:#x} with size {size}, larger than its object")]
    SizeMismatch { addr: usize, size: usize },
}

/// The errors of all the functions of this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// No address space or memory is available. This is the only error
    /// surfaced to callers.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
    #[error(transparent)]
    Corruption(#[from] Corruption),
    /// The platform refused a request that has no recovery, e.g. entropy.
    #[error("platform failure: {0}")]
    Platform(&'static str),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::OutOfMemory { .. })
    }
}
