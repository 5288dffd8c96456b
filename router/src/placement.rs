//! The placement engine: binds keys to cells and keeps occupancy honest.

use std::sync::Arc;

use catalog::interface::{Catalog, Error as CatalogError};
use cell_client::{Cell, CellFleet, RequestError};
use data_types::{Category, DirectoryEntry, KeyPath};
use observability_deps::tracing::{debug, error, info, warn};
use scaler::{ScalerHandle, ServerState};
use thiserror::Error;

/// Errors returned by placement operations, mapped onto the external API's
/// error vocabulary by the HTTP layer.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// No cell has room; the client is expected to retry later.
    #[error("no cell can accommodate {size} bytes")]
    CapacityUnavailable {
        /// The size that did not fit anywhere.
        size: u64,
    },

    /// The key is already bound; overwrite is not supported, the caller must
    /// delete first.
    #[error("key `{path}` already exists")]
    Conflict {
        /// The already-bound key.
        path: KeyPath,
    },

    /// The directory has no entry for this key.
    #[error("key `{path}` not found")]
    NotFound {
        /// The unknown key.
        path: KeyPath,
    },

    /// An invariant between the directory and the cells does not hold; the
    /// condition is logged and repaired by subsequent operations.
    #[error("placement invariant violated: {0}")]
    StateViolation(String),

    /// A catalog call failed.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// A cell call failed.
    #[error("cell error: {0}")]
    Cell(#[from] RequestError),
}

/// Places writes, resolves reads and deletes, and raises elasticity signals.
///
/// Two concurrent writes for different keys may both observe the same best
/// cell; the cell's own budget check is the backstop, surfacing `Full` to
/// whichever write lost the race. For a single key the directory's
/// conditional operations linearize all mutations.
#[derive(Debug)]
pub struct PlacementEngine {
    catalog: Arc<dyn Catalog>,
    fleet: Arc<dyn CellFleet>,
    scaler: ScalerHandle,
}

impl PlacementEngine {
    /// Create an engine over the given catalog, fleet and scaler handle.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        fleet: Arc<dyn CellFleet>,
        scaler: ScalerHandle,
    ) -> Self {
        Self {
            catalog,
            fleet,
            scaler,
        }
    }

    /// Store `payload` under `(category, path)`, returning the stored size.
    pub async fn put(
        &self,
        category: &Category,
        path: &KeyPath,
        payload: &str,
    ) -> Result<u64, PlacementError> {
        let size = payload.len() as u64;

        let cell_id = self
            .catalog
            .find_cell_with_at_least(size, None)
            .await?
            .ok_or(PlacementError::CapacityUnavailable { size })?;

        // placing on the cell currently being drained means only the top
        // cell fits: the fleet is too tight to shrink
        if let ServerState::Draining { top } = self.scaler.state() {
            if cell_id == top {
                info!(%cell_id, "write fits only on the draining cell - cancelling drain");
                self.scaler.cancel_drain();
            }
        }

        match self
            .catalog
            .insert_directory_entry(&DirectoryEntry {
                category: category.clone(),
                path: path.clone(),
                cell_id,
            })
            .await
        {
            Ok(()) => {}
            Err(CatalogError::EntryExists { .. }) => {
                return Err(PlacementError::Conflict { path: path.clone() })
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.fleet.cell(cell_id).put(path, payload).await {
            warn!(%cell_id, key = %path, error = %e, "cell write failed, rolling back placement");
            // best-effort: an entry left behind here points at a cell without
            // a copy until a later delete or overwritten placement repairs it
            if let Err(rollback) = self.catalog.delete_directory_entry(category, path).await {
                error!(
                    %cell_id,
                    key = %path,
                    error = %rollback,
                    "rollback of directory entry failed"
                );
            }
            return Err(e.into());
        }

        self.catalog
            .increment_cell_usage(cell_id, size as i64, 1)
            .await?;
        self.catalog.increment_server_usage(size as i64).await?;

        self.maybe_trigger_scale_up().await?;

        debug!(%cell_id, key = %path, size, "stored key");
        Ok(size)
    }

    /// Retrieve the payload stored under `(category, path)`.
    pub async fn get(&self, category: &Category, path: &KeyPath) -> Result<String, PlacementError> {
        let cell_id = self
            .catalog
            .get_cell_for_key(category, path)
            .await?
            .ok_or_else(|| PlacementError::NotFound { path: path.clone() })?;

        match self.fleet.cell(cell_id).get(path).await {
            Ok(payload) => Ok(payload),
            Err(RequestError::KeyNotFound { .. }) => {
                Err(PlacementError::StateViolation(format!(
                    "directory binds `{path}` to cell {cell_id} but the cell does not hold it"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `(category, path)`.
    ///
    /// A failed cell delete leaves the directory entry in place for the
    /// client to retry; occupancy is released only by the caller that
    /// actually removed the entry.
    pub async fn delete(&self, category: &Category, path: &KeyPath) -> Result<(), PlacementError> {
        let cell_id = self
            .catalog
            .get_cell_for_key(category, path)
            .await?
            .ok_or_else(|| PlacementError::NotFound { path: path.clone() })?;

        // the entry does not record the payload size; read it off the cell
        // before deleting
        let size = match self.fleet.cell(cell_id).get(path).await {
            Ok(payload) => payload.len() as u64,
            // entry without a copy: removing the entry below repairs it
            Err(RequestError::KeyNotFound { .. }) => 0,
            Err(e) => return Err(e.into()),
        };

        self.fleet.cell(cell_id).delete(path).await?;

        if self.catalog.delete_directory_entry(category, path).await? {
            self.catalog
                .increment_cell_usage(cell_id, -(size as i64), -1)
                .await?;
            self.catalog.increment_server_usage(-(size as i64)).await?;

            self.maybe_request_drain().await?;
        }

        debug!(%cell_id, key = %path, size, "deleted key");
        Ok(())
    }

    /// Post a scale-up request when the fleet's free space has dropped to
    /// the threshold and no transition is in flight.
    async fn maybe_trigger_scale_up(&self) -> Result<(), PlacementError> {
        let status = self.catalog.get_server_status().await?;
        if !status.wants_scale_up() {
            return Ok(());
        }

        if self.scaler.state() == ServerState::Snafu {
            info!(
                free_space = status.remaining_space(),
                threshold = status.scale_up_threshold,
                "free space at or below threshold - requesting scale-up"
            );
            self.scaler.trigger_scale_up();
        } else {
            debug!(
                free_space = status.remaining_space(),
                "scale-up condition holds but a transition is in flight"
            );
        }
        Ok(())
    }

    /// Post a drain request when the fleet could lose its top cell and keep
    /// the configured headroom.
    async fn maybe_request_drain(&self) -> Result<(), PlacementError> {
        let status = self.catalog.get_server_status().await?;
        let cell_capacity = status.total_space / u64::from(status.number_of_cells.max(1));
        if !status.wants_scale_down(cell_capacity) {
            return Ok(());
        }

        if self.scaler.state() == ServerState::Snafu {
            info!(
                free_space = status.remaining_space(),
                threshold = status.scale_down_threshold,
                "headroom above threshold - requesting drain of the top cell"
            );
            self.scaler.request_drain();
        }
        Ok(())
    }
}
