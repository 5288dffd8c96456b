//! Typed access to a single storage cell's HTTP surface, and the
//! [`CellFleet`] factory resolving cell ordinals to connections.
//!
//! All calls are synchronous request/response and idempotent-safe: a
//! retransmitted `put` of an identical `(key, payload)` pair reports success,
//! as does a `delete` of an absent key. Connections are short-lived; nothing
//! is pooled across requests.

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

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use data_types::{CellId, KeyPath};
use snafu::Snafu;

mod http;
pub mod mock;

pub use http::{HttpCell, HttpCellFleet, DEFAULT_REQUEST_TIMEOUT};

/// Errors that occur while making a request to a storage cell.
#[derive(Debug, Snafu)]
pub enum RequestError {
    /// While making a request to the cell, the underlying `reqwest` library
    /// returned an error that was not an HTTP 400 or 500.
    #[snafu(display("Error while processing the cell request: {source}"))]
    ReqwestProcessing {
        /// The underlying error object from `reqwest`.
        source: reqwest::Error,
    },

    /// The cell refused the write because the payload does not fit in its
    /// remaining byte budget.
    #[snafu(display("Cell {cell_id} has no room for {size} bytes"))]
    CellFull {
        /// The cell that refused the write.
        cell_id: CellId,
        /// The payload size that did not fit.
        size: u64,
    },

    /// The cell does not hold the requested key.
    #[snafu(display("Key `{path}` not present on cell {cell_id}"))]
    KeyNotFound {
        /// The cell that was asked.
        cell_id: CellId,
        /// The key that is absent.
        path: KeyPath,
    },

    /// The cell answered with an unexpected HTTP status.
    #[snafu(display("Cell returned HTTP {status}: `{text}`"))]
    Http {
        /// The status code of the unexpected response.
        status: reqwest::StatusCode,
        /// The response body, for the log.
        text: String,
    },

    /// The cell's response body did not deserialize.
    #[snafu(display("Error deserializing cell response: {source}, `{text}`"))]
    Deserializing {
        /// The underlying error from `serde_json`.
        source: serde_json::Error,
        /// The body that failed to parse.
        text: String,
    },
}

impl RequestError {
    /// `true` when the error is the typed capacity refusal rather than a
    /// transport problem.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::CellFull { .. })
    }
}

/// The inventory of one cell, as reported by its `/contents` endpoint.
///
/// Used only by the drain migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellContents {
    /// Unused bytes remaining in the cell's budget.
    pub free_space: u64,
    /// Every key the cell holds, with its payload size.
    pub items: Vec<ContentItem>,
}

/// One key held by a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    /// The raw key, as stored on the cell.
    pub id: String,
    /// The payload size in bytes.
    pub size: u64,
}

/// Operations on a single storage cell.
#[async_trait]
pub trait Cell: Debug + Send + Sync {
    /// Retrieve the payload stored under `path`.
    async fn get(&self, path: &KeyPath) -> Result<String, RequestError>;

    /// Store `payload` under `path`.
    ///
    /// The caller MUST have pre-checked capacity against the catalog; a cell
    /// that cannot fit the payload refuses it with [`RequestError::CellFull`].
    async fn put(&self, path: &KeyPath, payload: &str) -> Result<(), RequestError>;

    /// Remove `path`. Removing an absent key is success.
    async fn delete(&self, path: &KeyPath) -> Result<(), RequestError>;

    /// List everything the cell holds.
    async fn list_contents(&self) -> Result<CellContents, RequestError>;

    /// Liveness probe.
    async fn health(&self) -> Result<(), RequestError>;
}

/// Resolves a cell ordinal to a connection.
///
/// The fleet owns the addressing scheme; nothing above it builds cell URLs.
pub trait CellFleet: Debug + Send + Sync {
    /// A connection to the cell at `id`.
    fn cell(&self, id: CellId) -> Arc<dyn Cell>;
}
