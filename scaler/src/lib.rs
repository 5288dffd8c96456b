//! The elasticity controller.
//!
//! One long-lived task owns the fleet's scale state machine and every
//! orchestrator call:
//!
//! ```text
//!            scale-up request
//! SNAFU ───────────────────────▶ ScalingUp ──(replica running,
//!   │                                          catalog updated)──▶ SNAFU
//!   │ drain request
//!   ▼
//! Draining ──(all keys migrated)──▶ ScalingDown ──(replica absent)──▶ SNAFU
//!   │
//!   │ cancellation (only the top cell fits an incoming write)
//!   ▼
//! SNAFU
//! ```
//!
//! Request handlers never block on the task: they post requests through a
//! cloneable [`ScalerHandle`] and read the published state without locking.
//! Every transition is admitted by a compare-and-swap on the state cell, so
//! two racing requests start at most one transition, and every failure path
//! settles back in [`ServerState::Snafu`] - the machine cannot stick.

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

mod handle;
mod state;
mod task;

pub use handle::{ScaleRequest, ScalerHandle};
pub use state::{ServerState, StateCell};
pub use task::{ScaleError, Scaler, ScalerConfig};
