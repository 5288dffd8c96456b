//! Shared data types for the cellstore controller: cell ordinals, key
//! namespacing, the persisted catalog documents and cell network addressing.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    unreachable_pub
)]

// Workaround for "unused crate" lint false positives.
use workspace_hack as _;

use std::{borrow::Cow, fmt::Display};

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned when validating user-provided identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    /// The identifier is the empty string.
    #[error("identifier must not be empty")]
    Empty,

    /// The identifier contains a path separator, which would corrupt the
    /// request routing.
    #[error("identifier must not contain '/': {0:?}")]
    ContainsSlash(String),
}

/// The ordinal of a storage cell within the ordered replica set (0..N-1).
///
/// Cells are created and destroyed only at the high-ordinal end.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct CellId(u32);

impl CellId {
    /// Wrap an ordinal.
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    /// The raw ordinal.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The key namespace, defaulting to `"default"`.
///
/// All keys flowing through the external API live in the default category;
/// the catalog nevertheless keys directory entries by `(category, path)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    /// Validate and wrap a category name.
    pub fn try_new(v: impl Into<String>) -> Result<Self, IdentifierError> {
        let v = v.into();
        validate_identifier(&v)?;
        Ok(Self(v))
    }

    /// The category as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Category {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A key within its [`Category`]; unique per `(category, path)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPath(String);

impl KeyPath {
    /// Validate and wrap a key.
    pub fn try_new(v: impl Into<String>) -> Result<Self, IdentifierError> {
        let v = v.into();
        validate_identifier(&v)?;
        Ok(Self(v))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key percent-encoded for use as a URL path segment.
    pub fn as_path_segment(&self) -> Cow<'_, str> {
        utf8_percent_encode(&self.0, NON_ALPHANUMERIC).into()
    }
}

impl Display for KeyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

fn validate_identifier(v: &str) -> Result<(), IdentifierError> {
    if v.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if v.contains('/') {
        return Err(IdentifierError::ContainsSlash(v.to_string()));
    }
    Ok(())
}

/// Percent-decode a URL path segment into the raw identifier it carries.
pub fn decode_path_segment(v: &str) -> Result<String, std::str::Utf8Error> {
    Ok(percent_decode_str(v).decode_utf8()?.into_owned())
}

/// Percent-encode an arbitrary string for use as a URL path segment.
pub fn encode_path_segment(v: &str) -> String {
    utf8_percent_encode(v, NON_ALPHANUMERIC).to_string()
}

/// The singleton fleet status document (catalog id 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Cells currently in the fleet; always at least 1.
    pub number_of_cells: u32,
    /// Total capacity across the fleet, in bytes.
    pub total_space: u64,
    /// Bytes currently placed across the fleet; never exceeds `total_space`.
    pub used_space: u64,
    /// A scale-up fires when the remaining free space drops to this many
    /// bytes or fewer.
    pub scale_up_threshold: u64,
    /// The top cell becomes a drain candidate when
    /// `total_space - used_space - cell_capacity` is at least this many bytes.
    pub scale_down_threshold: u64,
    /// Replica name prefix used to derive cell network addresses.
    pub cell_name_prefix: String,
    /// Headless service name used to derive cell network addresses.
    pub cell_service_name: String,
}

impl ServerStatus {
    /// Remaining free space across the fleet.
    pub fn remaining_space(&self) -> u64 {
        self.total_space.saturating_sub(self.used_space)
    }

    /// The highest-ordinal cell, the only one ever drained or destroyed.
    pub fn top_cell(&self) -> CellId {
        CellId::new(self.number_of_cells.saturating_sub(1))
    }

    /// Whether the fleet is tight enough that a scale-up should fire.
    pub fn wants_scale_up(&self) -> bool {
        self.remaining_space() <= self.scale_up_threshold
    }

    /// Whether the fleet could lose its top cell (of `cell_capacity` bytes)
    /// and still keep `scale_down_threshold` bytes of headroom.
    pub fn wants_scale_down(&self, cell_capacity: u64) -> bool {
        self.number_of_cells > 1
            && self
                .remaining_space()
                .saturating_sub(cell_capacity)
                >= self.scale_down_threshold
    }
}

/// A typed partial update of the [`ServerStatus`] singleton.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStatusUpdate {
    /// New cell count, if changed.
    pub number_of_cells: Option<u32>,
    /// New total capacity, if changed.
    pub total_space: Option<u64>,
    /// New scale-up threshold, if changed.
    pub scale_up_threshold: Option<u64>,
    /// New scale-down threshold, if changed.
    pub scale_down_threshold: Option<u64>,
}

/// Per-cell occupancy record (catalog id = ordinal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellStatus {
    /// The cell's ordinal.
    pub id: CellId,
    /// The cell's fixed byte budget.
    pub capacity: u64,
    /// Unused bytes; `0 <= free_space <= capacity`.
    pub free_space: u64,
    /// Number of keys held by the cell.
    pub number_of_files: u64,
}

impl CellStatus {
    /// Bytes currently held by this cell.
    pub fn used_space(&self) -> u64 {
        self.capacity.saturating_sub(self.free_space)
    }
}

/// A directory entry binding one key to the cell currently holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// The key's namespace.
    pub category: Category,
    /// The key, unique within its category.
    pub path: KeyPath,
    /// The cell holding the value.
    pub cell_id: CellId,
}

/// Derives cell network addresses from the replica naming scheme:
/// `http://{prefix}-{ordinal}.{service}:{port}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellAddressing {
    /// Replica name prefix (`CELL_NAME_PREFIX`).
    pub name_prefix: String,
    /// Headless service name (`CELL_SERVICE_NAME`).
    pub service_name: String,
    /// Port each cell listens on (`CELL_PORT`).
    pub port: u16,
}

impl CellAddressing {
    /// The base URL of the cell at `id`.
    pub fn url(&self, id: CellId) -> String {
        format!(
            "http://{}-{}.{}:{}",
            self.name_prefix, id, self.service_name, self.port
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert_matches!(KeyPath::try_new(""), Err(IdentifierError::Empty));
        assert_matches!(
            KeyPath::try_new("a/b"),
            Err(IdentifierError::ContainsSlash(_))
        );
        assert_matches!(Category::try_new("metrics"), Ok(_));
        assert_eq!(Category::default().as_str(), "default");
    }

    #[test]
    fn test_path_segment_round_trip() {
        let key = KeyPath::try_new("hello world%42").unwrap();
        let seg = key.as_path_segment().into_owned();
        assert!(!seg.contains(' '));
        assert_eq!(decode_path_segment(&seg).unwrap(), "hello world%42");
    }

    #[test]
    fn test_cell_addressing() {
        let addressing = CellAddressing {
            name_prefix: "storagecells-sts".to_string(),
            service_name: "storage-cells-service".to_string(),
            port: 7777,
        };
        assert_eq!(
            addressing.url(CellId::new(2)),
            "http://storagecells-sts-2.storage-cells-service:7777"
        );
    }

    #[test]
    fn test_server_status_thresholds() {
        let mut status = ServerStatus {
            number_of_cells: 1,
            total_space: 100,
            used_space: 70,
            scale_up_threshold: 30,
            scale_down_threshold: 60,
            cell_name_prefix: "storagecells-sts".to_string(),
            cell_service_name: "storage-cells-service".to_string(),
        };

        // free == threshold fires
        assert!(status.wants_scale_up());
        status.used_space = 69;
        assert!(!status.wants_scale_up());

        // a single cell is never a drain candidate
        status.used_space = 0;
        assert!(!status.wants_scale_down(100));

        status.number_of_cells = 2;
        status.total_space = 200;
        status.used_space = 40;
        // 200 - 40 - 100 = 60 >= 60
        assert!(status.wants_scale_down(100));
        status.used_space = 41;
        assert!(!status.wants_scale_down(100));
    }

    #[test]
    fn test_top_cell() {
        let status = ServerStatus {
            number_of_cells: 3,
            total_space: 300,
            used_space: 0,
            scale_up_threshold: 30,
            scale_down_threshold: 60,
            cell_name_prefix: "p".to_string(),
            cell_service_name: "s".to_string(),
        };
        assert_eq!(status.top_cell(), CellId::new(2));
    }
}
