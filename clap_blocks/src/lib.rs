//! Building blocks for the clap configuration of the cellstore binaries.
//!
//! Every knob is settable both as a flag and through the environment
//! variables the service has historically been deployed with.

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

pub mod catalog;
pub mod fleet;
pub mod scaling;
