//! The cellstore request router.
//!
//! The router is responsible for:
//!
//! * Serving the external key/value API over HTTP
//! * Placing each write on a cell with room for it, and recording the
//!   placement in the catalog directory
//! * Resolving reads and deletes through the directory
//! * Keeping the fleet's occupancy counters current
//! * Raising scale-up, drain and drain-cancellation signals towards the
//!   elasticity controller
//!
//! ```text
//!                ┌──────────────┐
//!                │   HTTP API   │
//!                └──────────────┘
//!                        │
//!                        ▼
//!              ┌──────────────────┐        ┌─────────────┐
//!              │ PlacementEngine  │───────▶│   Catalog   │
//!              └──────────────────┘        └─────────────┘
//!                        │
//!                        ▼                 ┌─────────────┐
//!                ┌──────────────┐   ─ ─ ─ ▶│   Scaler    │
//!                │  Cell Fleet  │          └─────────────┘
//!                └──────────────┘
//! ```
//!
//! Handlers never talk to the workload orchestrator: elasticity signals are
//! posted through the scaler's handle, and the published scale state is read
//! without locking.

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

pub mod placement;
pub mod server;
