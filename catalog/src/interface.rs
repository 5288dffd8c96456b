//! Traits and data types of the catalog, independent of the backend.

use std::fmt::Debug;

use async_trait::async_trait;
use data_types::{Category, CellId, CellStatus, DirectoryEntry, KeyPath, ServerStatus, ServerStatusUpdate};
use thiserror::Error;

/// Errors returned by catalog operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The server status singleton has never been written.
    #[error("server status not initialized")]
    NotInitialized,

    /// The server status singleton already exists.
    #[error("server status already initialized")]
    AlreadyInitialized,

    /// A directory entry for this `(category, path)` already exists.
    #[error("directory entry already exists for {category}/{path}")]
    EntryExists {
        /// The namespace of the colliding key.
        category: Category,
        /// The colliding key.
        path: KeyPath,
    },

    /// No directory entry matched; for conditional rewrites this includes an
    /// entry whose cell no longer matches the expected one.
    #[error("no directory entry for {category}/{path} matching the expected state")]
    EntryNotFound {
        /// The namespace of the missing key.
        category: Category,
        /// The missing key.
        path: KeyPath,
    },

    /// No occupancy row exists for this cell.
    #[error("no status row for cell {id}")]
    CellNotFound {
        /// The cell without a row.
        id: CellId,
    },

    /// An occupancy row already exists for this cell.
    #[error("cell {id} already has a status row")]
    CellExists {
        /// The duplicated cell.
        id: CellId,
    },

    /// The backend failed.
    #[error("catalog backend error: {source}")]
    External {
        /// The backend's error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// A specialized `Result` for catalog errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Parameters of the one-time catalog initialization performed by the first
/// controller to start against an empty catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialStatus {
    /// The byte budget of every cell.
    pub cell_capacity: u64,
    /// Free-space floor at which a scale-up fires.
    pub scale_up_threshold: u64,
    /// Headroom above which the top cell becomes a drain candidate.
    pub scale_down_threshold: u64,
    /// Replica name prefix for cell addressing.
    pub cell_name_prefix: String,
    /// Headless service name for cell addressing.
    pub cell_service_name: String,
}

/// Operations on the persisted fleet state.
///
/// Implementations MUST apply counter updates atomically and directory
/// mutations conditionally, as documented per method; the placement and
/// elasticity engines rely on the catalog as their serialization point.
#[async_trait]
pub trait Catalog: Debug + Send + Sync {
    /// Create backing schema and indexes, and verify connectivity.
    async fn setup(&self) -> Result<()>;

    /// Read the server status singleton.
    async fn get_server_status(&self) -> Result<ServerStatus>;

    /// Insert the singleton for a fleet of one empty cell.
    ///
    /// Returns [`Error::AlreadyInitialized`] when racing another controller's
    /// initialization.
    async fn initialize_server_status(&self, init: InitialStatus) -> Result<ServerStatus>;

    /// Typed partial update of the singleton.
    async fn update_server_status(&self, update: ServerStatusUpdate) -> Result<()>;

    /// The lowest-ordinal cell with at least `bytes` of free space, skipping
    /// `exclude` if set.
    ///
    /// Lowest-ordinal tie-breaking concentrates load in low-numbered cells,
    /// keeping the top cell the natural drain candidate.
    async fn find_cell_with_at_least(
        &self,
        bytes: u64,
        exclude: Option<CellId>,
    ) -> Result<Option<CellId>>;

    /// The cell currently bound to `(category, path)`, if any.
    async fn get_cell_for_key(&self, category: &Category, path: &KeyPath)
        -> Result<Option<CellId>>;

    /// Bind a key to a cell.
    ///
    /// Returns [`Error::EntryExists`] when the `(category, path)` pair is
    /// already bound; exactly one of two racing inserts wins.
    async fn insert_directory_entry(&self, entry: &DirectoryEntry) -> Result<()>;

    /// Rebind a key from `old_cell` to `new_cell`, conditionally.
    ///
    /// The update applies only while the entry still points at `old_cell`;
    /// otherwise [`Error::EntryNotFound`] is returned and the caller must
    /// restart from a directory lookup.
    async fn update_directory_entry_cell(
        &self,
        category: &Category,
        path: &KeyPath,
        old_cell: CellId,
        new_cell: CellId,
    ) -> Result<()>;

    /// Unbind a key, returning whether an entry was removed.
    ///
    /// Unbinding an absent key is success; of two racing unbinds exactly one
    /// observes `true`, and only that caller adjusts occupancy counters.
    async fn delete_directory_entry(&self, category: &Category, path: &KeyPath) -> Result<bool>;

    /// Atomically adjust one cell's occupancy: `delta_bytes` subtracts from
    /// `free_space` (negative values give space back), `delta_files` adds to
    /// the file count.
    async fn increment_cell_usage(
        &self,
        id: CellId,
        delta_bytes: i64,
        delta_files: i64,
    ) -> Result<()>;

    /// Atomically adjust the fleet-wide `used_space`.
    async fn increment_server_usage(&self, delta_bytes: i64) -> Result<()>;

    /// Insert the occupancy row of a newly created cell, fully free.
    async fn add_cell(&self, id: CellId, capacity: u64) -> Result<()>;

    /// Delete the occupancy row of a destroyed cell.
    async fn remove_cell(&self, id: CellId) -> Result<()>;

    /// All occupancy rows, ordered by ordinal.
    async fn list_cells(&self) -> Result<Vec<CellStatus>>;
}
