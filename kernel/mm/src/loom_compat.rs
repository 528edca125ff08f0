//! Loom compatibility shim.
//!
//! Under `cfg(loom)` the ledger counters are loom atomics so concurrent
//! count updates can be model-checked; otherwise they are the `core` ones.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicU32, Ordering};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicU32, Ordering};
