//! Concurrency primitives.
//!
//! None of these allocate, and all of them are usable from `const`
//! initializers so they can live in statics.

mod aba;
mod combining;
mod flag_lock;
pub mod fork;
mod singleton;

pub use self::{
    aba::{AbaLinked, AbaStack, Cmp},
    combining::CombiningLock,
    flag_lock::{FlagLock, FlagLockGuard},
    fork::PreventFork,
    singleton::Singleton,
};
