//! Core types for the VMS copy-on-write memory core.
//!
//! Address newtypes, page-table geometry, configuration, logging and the
//! spin lock used by the reference ledger. Everything here is host-testable
//! with `cargo test`; the crate is `no_std` outside of tests.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod config;
pub mod log;
pub mod paging;
pub mod sync;
