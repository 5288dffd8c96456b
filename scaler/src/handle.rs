//! A handle to interact with the [`Scaler`] task.
//!
//! [`Scaler`]: crate::task::Scaler

use std::sync::Arc;

use observability_deps::tracing::debug;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::state::{ServerState, StateCell};

/// A request posted to the scaler task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleRequest {
    /// Grow the fleet by one cell.
    Up,
    /// Drain the top cell and, if the drain completes, shrink the fleet.
    Drain,
}

/// A cheap, cloneable handle held by every request handler.
///
/// Posting is non-blocking: requests are placed into a small queue consumed
/// by the scaler task. A full queue drops the request with a debug log - the
/// triggering condition re-fires on a later operation, and a queued request
/// that has become stale is refused at the task's admission check anyway.
#[derive(Debug, Clone)]
pub struct ScalerHandle {
    state: Arc<StateCell>,
    req_tx: mpsc::Sender<ScaleRequest>,
    drain_cancel: Arc<Mutex<CancellationToken>>,
}

impl ScalerHandle {
    pub(crate) fn new(
        state: Arc<StateCell>,
        req_tx: mpsc::Sender<ScaleRequest>,
        drain_cancel: Arc<Mutex<CancellationToken>>,
    ) -> Self {
        Self {
            state,
            req_tx,
            drain_cancel,
        }
    }

    /// The currently published scale state.
    ///
    /// Readers may observe a value that is stale by one update quantum.
    pub fn state(&self) -> ServerState {
        self.state.load()
    }

    /// Ask the task to grow the fleet.
    pub fn trigger_scale_up(&self) {
        if self.req_tx.try_send(ScaleRequest::Up).is_err() {
            debug!("scale-up request dropped - scaler queue full or gone");
        }
    }

    /// Ask the task to drain the top cell and shrink the fleet.
    pub fn request_drain(&self) {
        if self.req_tx.try_send(ScaleRequest::Drain).is_err() {
            debug!("drain request dropped - scaler queue full or gone");
        }
    }

    /// Signal the in-flight drain (if any) to stop.
    ///
    /// The scaler task observes the signal between migration items and
    /// performs the `Draining -> Snafu` transition itself; keys already
    /// migrated stay where the conditional directory rewrites put them.
    pub fn cancel_drain(&self) {
        self.drain_cancel.lock().cancel();
    }
}
