//! The catalog is the persisted, authoritative record of the fleet: the
//! server status singleton, one occupancy row per cell, and the directory
//! binding every key to the cell holding it.
//!
//! Counter updates are atomic increments applied by the backend; they are
//! the serialization point for occupancy bookkeeping under concurrent
//! request handlers. Directory rewrites are conditional on the previously
//! observed cell so that exactly one of two racing mutations wins.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    unreachable_pub
)]

// Workaround for "unused crate" lint false positives.
use workspace_hack as _;

pub mod interface;
pub mod mem;
pub mod mongo;
