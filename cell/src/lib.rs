//! A storage cell: a single-process, in-memory key/value store with a fixed
//! byte budget, addressed by the controller through its ordinal.
//!
//! The cell enforces only its own budget; deciding *where* a key belongs is
//! the controller's job. Everything here is deliberately thin.

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

mod server;
mod store;

pub use server::{serve, CellDelegate};
pub use store::{KeyStore, StoreOutcome};
