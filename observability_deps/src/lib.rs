//! Holds the observability dependencies of the workspace so that all crates
//! pull in the same `tracing` version with the same feature set.
//!
//! Crates in this workspace log through this re-export rather than depending
//! on `tracing` directly.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

// Workaround for "unused crate" lint false positives.
use workspace_hack as _;

pub use tracing;
