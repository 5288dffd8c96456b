//! The long-lived task driving scale transitions to completion.

use std::sync::Arc;

use backoff::{BackoffConfig, BackoffError};
use catalog::interface::{Catalog, Error as CatalogError};
use cell_client::{Cell, CellFleet, RequestError};
use data_types::{Category, CellId, KeyPath, ServerStatusUpdate};
use observability_deps::tracing::{debug, error, info, warn};
use orchestrator::{wait_for_replica, Orchestrator, ReplicaPhase, WaitError};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    handle::{ScaleRequest, ScalerHandle},
    state::{ServerState, StateCell},
};

/// Depth of the request queue between handlers and the task. Requests carry
/// no payload and stale ones are refused at admission, so a shallow queue
/// suffices.
const REQUEST_QUEUE_DEPTH: usize = 4;

/// Errors surfaced by a failed scale transition.
///
/// Every one of these drops the state machine back to
/// [`ServerState::Snafu`]; none leaves a transition in flight.
#[derive(Debug, Error)]
pub enum ScaleError {
    /// A catalog operation failed.
    #[error("catalog error during scale transition: {0}")]
    Catalog(#[from] CatalogError),

    /// An orchestrator call failed.
    #[error("orchestrator error during scale transition: {0}")]
    Orchestrator(#[from] orchestrator::Error),

    /// A replica did not reach the required phase in time.
    #[error("replica phase wait failed: {0}")]
    Wait(#[from] BackoffError<WaitError>),

    /// A cell call failed while migrating keys.
    #[error("cell error during drain: {0}")]
    Cell(#[from] RequestError),

    /// No cell other than the one being drained can hold a key; the fleet is
    /// too tight to shrink.
    #[error("no destination cell with room for {size} bytes during drain")]
    NoDrainDestination {
        /// Size of the key that could not be placed.
        size: u64,
    },
}

/// Tuning of the scaler task.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    /// The byte budget of every cell, used to size catalog rows for new
    /// cells and to adjust `total_space`.
    pub cell_capacity: u64,
    /// Polling cadence for replica phase waits.
    pub replica_poll: BackoffConfig,
}

impl ScalerConfig {
    /// Config with the mandated replica polling cadence.
    pub fn new(cell_capacity: u64) -> Self {
        Self {
            cell_capacity,
            replica_poll: orchestrator::replica_poll_backoff(),
        }
    }
}

enum DrainOutcome {
    Completed,
    Cancelled,
}

/// The elasticity controller task.
///
/// Owns the state machine and all orchestrator calls; request handlers talk
/// to it exclusively through the [`ScalerHandle`] returned by [`new`].
///
/// [`new`]: Scaler::new
#[derive(Debug)]
pub struct Scaler {
    config: ScalerConfig,
    catalog: Arc<dyn Catalog>,
    fleet: Arc<dyn CellFleet>,
    orchestrator: Arc<dyn Orchestrator>,
    state: Arc<StateCell>,
    drain_cancel: Arc<Mutex<CancellationToken>>,
    req_rx: mpsc::Receiver<ScaleRequest>,
}

impl Scaler {
    /// Create the task and the handle request handlers use to reach it.
    pub fn new(
        config: ScalerConfig,
        catalog: Arc<dyn Catalog>,
        fleet: Arc<dyn CellFleet>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> (Self, ScalerHandle) {
        let state = Arc::new(StateCell::new());
        let drain_cancel = Arc::new(Mutex::new(CancellationToken::new()));
        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);

        let handle = ScalerHandle::new(
            Arc::clone(&state),
            req_tx,
            Arc::clone(&drain_cancel),
        );

        (
            Self {
                config,
                catalog,
                fleet,
                orchestrator,
                state,
                drain_cancel,
                req_rx,
            },
            handle,
        )
    }

    /// Process scale requests until every [`ScalerHandle`] is dropped.
    pub async fn run(mut self) {
        info!("scaler task started");
        while let Some(req) = self.req_rx.recv().await {
            match req {
                ScaleRequest::Up => {
                    if let Err(e) = self.scale_up().await {
                        warn!(error = %e, "scale-up failed");
                    }
                }
                ScaleRequest::Drain => {
                    if let Err(e) = self.drain_then_scale_down().await {
                        warn!(error = %e, "drain failed");
                    }
                }
            }
        }
        info!("scaler task shut down");
    }

    /// Settle back into `Snafu` from `from`, forcing the state if something
    /// else unexpectedly moved it.
    fn settle(&self, from: ServerState) {
        if let Err(actual) = self.state.transition(from, ServerState::Snafu) {
            error!(
                expected = ?from,
                ?actual,
                "state moved during a transition owned by this task"
            );
            self.state.force(ServerState::Snafu);
        }
    }

    async fn scale_up(&self) -> Result<(), ScaleError> {
        if let Err(actual) = self
            .state
            .transition(ServerState::Snafu, ServerState::ScalingUp)
        {
            debug!(state = ?actual, "scale-up request refused - transition in flight");
            return Ok(());
        }

        let result = self.try_scale_up().await;
        self.settle(ServerState::ScalingUp);
        result
    }

    async fn try_scale_up(&self) -> Result<(), ScaleError> {
        let status = self.catalog.get_server_status().await?;
        let n = status.number_of_cells;
        let new_cell = CellId::new(n);

        info!(cells = n, new_cell = %new_cell, "scaling up");

        self.orchestrator.scale_to(n + 1).await?;
        wait_for_replica(
            self.orchestrator.as_ref(),
            new_cell,
            ReplicaPhase::Running,
            &self.config.replica_poll,
        )
        .await?;

        match self.catalog.add_cell(new_cell, self.config.cell_capacity).await {
            Ok(()) => {}
            // a leftover row from an interrupted previous scale-up
            Err(CatalogError::CellExists { id }) => {
                warn!(cell = %id, "cell status row already present, adopting it")
            }
            Err(e) => return Err(e.into()),
        }

        self.catalog
            .update_server_status(ServerStatusUpdate {
                number_of_cells: Some(n + 1),
                total_space: Some(status.total_space + self.config.cell_capacity),
                ..Default::default()
            })
            .await?;

        info!(cells = n + 1, "scale-up complete");
        Ok(())
    }

    async fn drain_then_scale_down(&self) -> Result<(), ScaleError> {
        let status = self.catalog.get_server_status().await?;
        if status.number_of_cells <= 1 {
            debug!("drain request refused - nothing to drain");
            return Ok(());
        }
        let top = status.top_cell();

        // Publish the fresh cancellation scope before the state transition:
        // a handler that observes `Draining` must land its cancellation on
        // this drain's token, never on a stale one. The release store of the
        // state below makes the new token visible to every such observer.
        let cancel = CancellationToken::new();
        *self.drain_cancel.lock() = cancel.clone();

        if let Err(actual) = self
            .state
            .transition(ServerState::Snafu, ServerState::Draining { top })
        {
            debug!(state = ?actual, "drain request refused - transition in flight");
            return Ok(());
        }

        match self.try_drain(top, &cancel).await {
            Ok(DrainOutcome::Completed) => {
                if let Err(actual) = self.state.transition(
                    ServerState::Draining { top },
                    ServerState::ScalingDown { top },
                ) {
                    error!(?actual, "state moved during drain");
                    self.state.force(ServerState::Snafu);
                    return Ok(());
                }
                let result = self.try_scale_down(top).await;
                self.settle(ServerState::ScalingDown { top });
                result
            }
            Ok(DrainOutcome::Cancelled) => {
                info!(%top, "drain cancelled - fleet too tight to shrink");
                self.settle(ServerState::Draining { top });
                Ok(())
            }
            Err(e) => {
                self.settle(ServerState::Draining { top });
                Err(e)
            }
        }
    }

    /// Migrate every key off `top`.
    ///
    /// Each key is copied cell-to-cell, then its directory entry rewritten
    /// conditionally; the rewrite is what makes the copy authoritative, so
    /// partial copies left by an abort are harmless. Cancellation is observed
    /// between items.
    async fn try_drain(
        &self,
        top: CellId,
        cancel: &CancellationToken,
    ) -> Result<DrainOutcome, ScaleError> {
        let source = self.fleet.cell(top);
        let contents = source.list_contents().await?;
        info!(%top, items = contents.items.len(), "draining top cell");

        let mut migrated = Vec::new();
        for item in contents.items {
            if cancel.is_cancelled() {
                return Ok(DrainOutcome::Cancelled);
            }

            let path = match KeyPath::try_new(item.id.clone()) {
                Ok(path) => path,
                Err(e) => {
                    warn!(id = %item.id, error = %e, "skipping malformed key during drain");
                    continue;
                }
            };

            let dest = self
                .catalog
                .find_cell_with_at_least(item.size, Some(top))
                .await?
                .ok_or(ScaleError::NoDrainDestination { size: item.size })?;

            let payload = source.get(&path).await?;
            self.fleet.cell(dest).put(&path, &payload).await?;

            match self
                .catalog
                .update_directory_entry_cell(&Category::default(), &path, top, dest)
                .await
            {
                Ok(()) => {
                    self.catalog
                        .increment_cell_usage(dest, item.size as i64, 1)
                        .await?;
                    self.catalog
                        .increment_cell_usage(top, -(item.size as i64), -1)
                        .await?;
                    debug!(%top, %dest, key = %path, "migrated key");
                    migrated.push(path);
                }
                // the key was deleted (or otherwise rebound) while we copied
                // it; our copy is not authoritative - drop it
                Err(CatalogError::EntryNotFound { .. }) => {
                    let _ = self.fleet.cell(dest).delete(&path).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // best-effort cleanup; the cell is destroyed right afterwards anyway
        for path in &migrated {
            if let Err(e) = source.delete(path).await {
                debug!(%top, key = %path, error = %e, "post-drain cleanup delete failed");
            }
        }

        Ok(DrainOutcome::Completed)
    }

    async fn try_scale_down(&self, top: CellId) -> Result<(), ScaleError> {
        let status = self.catalog.get_server_status().await?;
        let n = status.number_of_cells;

        info!(cells = n, %top, "scaling down");

        self.orchestrator.scale_to(n - 1).await?;
        wait_for_replica(
            self.orchestrator.as_ref(),
            top,
            ReplicaPhase::Absent,
            &self.config.replica_poll,
        )
        .await?;

        match self.catalog.remove_cell(top).await {
            Ok(()) => {}
            Err(CatalogError::CellNotFound { id }) => {
                warn!(cell = %id, "cell status row already removed")
            }
            Err(e) => return Err(e.into()),
        }

        self.catalog
            .update_server_status(ServerStatusUpdate {
                number_of_cells: Some(n - 1),
                total_space: Some(status.total_space - self.config.cell_capacity),
                ..Default::default()
            })
            .await?;

        // volume pruning is off the critical path
        let orchestrator = Arc::clone(&self.orchestrator);
        let keep = top.get();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.prune_volumes(keep).await {
                warn!(keep, error = %e, "persistent volume pruning failed");
            }
        });

        info!(cells = n - 1, "scale-down complete");
        Ok(())
    }
}
