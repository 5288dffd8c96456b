//! An in-memory [`CellFleet`] with byte-budgeted map-backed cells, for
//! exercising the placement and elasticity engines without a network.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use data_types::{CellId, KeyPath};
use parking_lot::Mutex;

use crate::{Cell, CellContents, CellFleet, ContentItem, RequestError};

/// A fleet of [`MockCell`]s, created lazily on first access the way replicas
/// of the real fleet appear when the replica set grows.
#[derive(Debug)]
pub struct MockFleet {
    capacity: u64,
    cells: Mutex<BTreeMap<CellId, Arc<MockCell>>>,
}

impl MockFleet {
    /// A fleet whose cells each hold `capacity` bytes.
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            cells: Mutex::new(BTreeMap::new()),
        })
    }

    /// The concrete mock cell at `id`, for inspection and failure injection.
    pub fn mock_cell(&self, id: CellId) -> Arc<MockCell> {
        Arc::clone(
            self.cells
                .lock()
                .entry(id)
                .or_insert_with(|| Arc::new(MockCell::new(id, self.capacity))),
        )
    }
}

impl CellFleet for MockFleet {
    fn cell(&self, id: CellId) -> Arc<dyn Cell> {
        self.mock_cell(id)
    }
}

#[derive(Debug, Default)]
struct MockCellState {
    used: u64,
    storage: BTreeMap<String, String>,
}

/// A map-backed cell honouring the fixed byte budget and the idempotency
/// rules of the real cell daemon.
#[derive(Debug)]
pub struct MockCell {
    cell_id: CellId,
    capacity: u64,
    state: Mutex<MockCellState>,
    fail_requests: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MockCell {
    fn new(cell_id: CellId, capacity: u64) -> Self {
        Self {
            cell_id,
            capacity,
            state: Mutex::new(MockCellState::default()),
            fail_requests: AtomicBool::new(false),
            latency: Mutex::new(None),
        }
    }

    /// Make every subsequent call fail with a transport-level error.
    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`, simulating a slow network.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// The payload stored under `path`, if any.
    pub fn payload(&self, path: &str) -> Option<String> {
        self.state.lock().storage.get(path).cloned()
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.state.lock().storage.len()
    }

    /// `true` when the cell holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_transport(&self) -> Result<(), RequestError> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(RequestError::Http {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                text: "injected transport failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Cell for MockCell {
    async fn get(&self, path: &KeyPath) -> Result<String, RequestError> {
        self.simulate_latency().await;
        self.check_transport()?;
        self.payload(path.as_str())
            .ok_or_else(|| RequestError::KeyNotFound {
                cell_id: self.cell_id,
                path: path.clone(),
            })
    }

    async fn put(&self, path: &KeyPath, payload: &str) -> Result<(), RequestError> {
        self.simulate_latency().await;
        self.check_transport()?;
        let mut state = self.state.lock();

        // a retransmit of an identical write is success
        let old_size = match state.storage.get(path.as_str()) {
            Some(old) if old == payload => return Ok(()),
            Some(old) => old.len() as u64,
            None => 0,
        };

        let size = payload.len() as u64;
        if state.used - old_size + size > self.capacity {
            return Err(RequestError::CellFull {
                cell_id: self.cell_id,
                size,
            });
        }

        state.used = state.used - old_size + size;
        state.storage.insert(path.as_str().to_string(), payload.to_string());
        Ok(())
    }

    async fn delete(&self, path: &KeyPath) -> Result<(), RequestError> {
        self.simulate_latency().await;
        self.check_transport()?;
        let mut state = self.state.lock();
        if let Some(old) = state.storage.remove(path.as_str()) {
            state.used -= old.len() as u64;
        }
        Ok(())
    }

    async fn list_contents(&self) -> Result<CellContents, RequestError> {
        self.simulate_latency().await;
        self.check_transport()?;
        let state = self.state.lock();
        Ok(CellContents {
            free_space: self.capacity - state.used,
            items: state
                .storage
                .iter()
                .map(|(id, payload)| ContentItem {
                    id: id.clone(),
                    size: payload.len() as u64,
                })
                .collect(),
        })
    }

    async fn health(&self) -> Result<(), RequestError> {
        self.simulate_latency().await;
        self.check_transport()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: &str) -> KeyPath {
        KeyPath::try_new(v).unwrap()
    }

    #[tokio::test]
    async fn test_budget_enforced() {
        let fleet = MockFleet::new(10);
        let cell = fleet.cell(CellId::new(0));

        cell.put(&key("a"), "xxxxx").await.unwrap();
        let err = cell.put(&key("b"), "yyyyyy").await.unwrap_err();
        assert!(err.is_full(), "{err}");

        // an identical retransmit is success even when the budget is tight
        cell.put(&key("a"), "xxxxx").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_reclaims_budget() {
        let fleet = MockFleet::new(10);
        let cell = fleet.cell(CellId::new(0));

        cell.put(&key("a"), "xxxxxxxxxx").await.unwrap();
        cell.delete(&key("a")).await.unwrap();
        // absent delete is success
        cell.delete(&key("a")).await.unwrap();
        cell.put(&key("b"), "zzz").await.unwrap();

        let contents = cell.list_contents().await.unwrap();
        assert_eq!(contents.free_space, 7);
        assert_eq!(contents.items.len(), 1);
    }
}
