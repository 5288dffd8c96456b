//! In-memory catalog, the serialization point for tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use data_types::{
    Category, CellId, CellStatus, DirectoryEntry, KeyPath, ServerStatus, ServerStatusUpdate,
};
use parking_lot::Mutex;

use crate::interface::{Catalog, Error, InitialStatus, Result};

#[derive(Debug, Default)]
struct MemState {
    server: Option<ServerStatus>,
    cells: BTreeMap<CellId, CellStatus>,
    directory: BTreeMap<(Category, KeyPath), CellId>,
}

/// An in-memory [`Catalog`] backed by a single mutex, mirroring the atomic
/// update semantics of the production backend.
#[derive(Debug, Default)]
pub struct MemCatalog {
    state: Mutex<MemState>,
}

impl MemCatalog {
    /// An empty, uninitialized catalog.
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn get_server_status(&self) -> Result<ServerStatus> {
        self.state
            .lock()
            .server
            .clone()
            .ok_or(Error::NotInitialized)
    }

    async fn initialize_server_status(&self, init: InitialStatus) -> Result<ServerStatus> {
        let mut state = self.state.lock();
        if state.server.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let status = ServerStatus {
            number_of_cells: 1,
            total_space: init.cell_capacity,
            used_space: 0,
            scale_up_threshold: init.scale_up_threshold,
            scale_down_threshold: init.scale_down_threshold,
            cell_name_prefix: init.cell_name_prefix,
            cell_service_name: init.cell_service_name,
        };
        state.server = Some(status.clone());
        state.cells.insert(
            CellId::new(0),
            CellStatus {
                id: CellId::new(0),
                capacity: init.cell_capacity,
                free_space: init.cell_capacity,
                number_of_files: 0,
            },
        );
        Ok(status)
    }

    async fn update_server_status(&self, update: ServerStatusUpdate) -> Result<()> {
        let mut state = self.state.lock();
        let server = state.server.as_mut().ok_or(Error::NotInitialized)?;
        if let Some(v) = update.number_of_cells {
            server.number_of_cells = v;
        }
        if let Some(v) = update.total_space {
            server.total_space = v;
        }
        if let Some(v) = update.scale_up_threshold {
            server.scale_up_threshold = v;
        }
        if let Some(v) = update.scale_down_threshold {
            server.scale_down_threshold = v;
        }
        Ok(())
    }

    async fn find_cell_with_at_least(
        &self,
        bytes: u64,
        exclude: Option<CellId>,
    ) -> Result<Option<CellId>> {
        let state = self.state.lock();
        Ok(state
            .cells
            .values()
            .filter(|cell| Some(cell.id) != exclude)
            .find(|cell| cell.free_space >= bytes)
            .map(|cell| cell.id))
    }

    async fn get_cell_for_key(
        &self,
        category: &Category,
        path: &KeyPath,
    ) -> Result<Option<CellId>> {
        let state = self.state.lock();
        Ok(state
            .directory
            .get(&(category.clone(), path.clone()))
            .copied())
    }

    async fn insert_directory_entry(&self, entry: &DirectoryEntry) -> Result<()> {
        let mut state = self.state.lock();
        let key = (entry.category.clone(), entry.path.clone());
        if state.directory.contains_key(&key) {
            return Err(Error::EntryExists {
                category: entry.category.clone(),
                path: entry.path.clone(),
            });
        }
        state.directory.insert(key, entry.cell_id);
        Ok(())
    }

    async fn update_directory_entry_cell(
        &self,
        category: &Category,
        path: &KeyPath,
        old_cell: CellId,
        new_cell: CellId,
    ) -> Result<()> {
        let mut state = self.state.lock();
        match state.directory.get_mut(&(category.clone(), path.clone())) {
            Some(cell) if *cell == old_cell => {
                *cell = new_cell;
                Ok(())
            }
            _ => Err(Error::EntryNotFound {
                category: category.clone(),
                path: path.clone(),
            }),
        }
    }

    async fn delete_directory_entry(&self, category: &Category, path: &KeyPath) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .directory
            .remove(&(category.clone(), path.clone()))
            .is_some())
    }

    async fn increment_cell_usage(
        &self,
        id: CellId,
        delta_bytes: i64,
        delta_files: i64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let cell = state.cells.get_mut(&id).ok_or(Error::CellNotFound { id })?;
        cell.free_space = apply_delta(cell.free_space, -delta_bytes);
        cell.number_of_files = apply_delta(cell.number_of_files, delta_files);
        Ok(())
    }

    async fn increment_server_usage(&self, delta_bytes: i64) -> Result<()> {
        let mut state = self.state.lock();
        let server = state.server.as_mut().ok_or(Error::NotInitialized)?;
        server.used_space = apply_delta(server.used_space, delta_bytes);
        Ok(())
    }

    async fn add_cell(&self, id: CellId, capacity: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.cells.contains_key(&id) {
            return Err(Error::CellExists { id });
        }
        state.cells.insert(
            id,
            CellStatus {
                id,
                capacity,
                free_space: capacity,
                number_of_files: 0,
            },
        );
        Ok(())
    }

    async fn remove_cell(&self, id: CellId) -> Result<()> {
        let mut state = self.state.lock();
        state
            .cells
            .remove(&id)
            .map(drop)
            .ok_or(Error::CellNotFound { id })
    }

    async fn list_cells(&self) -> Result<Vec<CellStatus>> {
        Ok(self.state.lock().cells.values().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn key(v: &str) -> KeyPath {
        KeyPath::try_new(v).unwrap()
    }

    fn test_init() -> InitialStatus {
        InitialStatus {
            cell_capacity: 100,
            scale_up_threshold: 30,
            scale_down_threshold: 60,
            cell_name_prefix: "storagecells-sts".to_string(),
            cell_service_name: "storage-cells-service".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initialize_once() {
        let catalog = MemCatalog::new();

        assert_matches!(
            catalog.get_server_status().await,
            Err(Error::NotInitialized)
        );

        let status = catalog.initialize_server_status(test_init()).await.unwrap();
        assert_eq!(status.number_of_cells, 1);
        assert_eq!(status.total_space, 100);
        assert_eq!(status.used_space, 0);

        assert_matches!(
            catalog.initialize_server_status(test_init()).await,
            Err(Error::AlreadyInitialized)
        );

        let cells = catalog.list_cells().await.unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].free_space, 100);
    }

    #[tokio::test]
    async fn test_find_cell_lowest_ordinal_wins() {
        let catalog = MemCatalog::new();
        catalog.initialize_server_status(test_init()).await.unwrap();
        catalog.add_cell(CellId::new(1), 100).await.unwrap();
        catalog.add_cell(CellId::new(2), 100).await.unwrap();

        // all cells fit; ties break towards the lowest ordinal
        assert_eq!(
            catalog.find_cell_with_at_least(10, None).await.unwrap(),
            Some(CellId::new(0))
        );

        // fill cell 0, the next candidate is cell 1
        catalog
            .increment_cell_usage(CellId::new(0), 95, 1)
            .await
            .unwrap();
        assert_eq!(
            catalog.find_cell_with_at_least(10, None).await.unwrap(),
            Some(CellId::new(1))
        );

        // excluding the best candidate falls through to the next
        assert_eq!(
            catalog
                .find_cell_with_at_least(10, Some(CellId::new(1)))
                .await
                .unwrap(),
            Some(CellId::new(2))
        );

        // nothing fits an oversized request
        assert_eq!(
            catalog.find_cell_with_at_least(1000, None).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_directory_uniqueness() {
        let catalog = MemCatalog::new();
        catalog.initialize_server_status(test_init()).await.unwrap();

        let entry = DirectoryEntry {
            category: Category::default(),
            path: key("banana"),
            cell_id: CellId::new(0),
        };
        catalog.insert_directory_entry(&entry).await.unwrap();
        assert_matches!(
            catalog.insert_directory_entry(&entry).await,
            Err(Error::EntryExists { .. })
        );

        // the same path in a different category is a distinct key
        let other = DirectoryEntry {
            category: Category::try_new("other").unwrap(),
            path: key("banana"),
            cell_id: CellId::new(0),
        };
        catalog.insert_directory_entry(&other).await.unwrap();
    }

    #[tokio::test]
    async fn test_conditional_rewrite() {
        let catalog = MemCatalog::new();
        catalog.initialize_server_status(test_init()).await.unwrap();

        let entry = DirectoryEntry {
            category: Category::default(),
            path: key("banana"),
            cell_id: CellId::new(1),
        };
        catalog.insert_directory_entry(&entry).await.unwrap();

        // a rewrite conditioned on a stale cell loses
        assert_matches!(
            catalog
                .update_directory_entry_cell(
                    &Category::default(),
                    &key("banana"),
                    CellId::new(0),
                    CellId::new(2),
                )
                .await,
            Err(Error::EntryNotFound { .. })
        );

        catalog
            .update_directory_entry_cell(
                &Category::default(),
                &key("banana"),
                CellId::new(1),
                CellId::new(0),
            )
            .await
            .unwrap();
        assert_eq!(
            catalog
                .get_cell_for_key(&Category::default(), &key("banana"))
                .await
                .unwrap(),
            Some(CellId::new(0))
        );
    }

    #[tokio::test]
    async fn test_usage_counters() {
        let catalog = MemCatalog::new();
        catalog.initialize_server_status(test_init()).await.unwrap();

        catalog
            .increment_cell_usage(CellId::new(0), 5, 1)
            .await
            .unwrap();
        catalog.increment_server_usage(5).await.unwrap();

        let cells = catalog.list_cells().await.unwrap();
        assert_eq!(cells[0].free_space, 95);
        assert_eq!(cells[0].number_of_files, 1);
        assert_eq!(catalog.get_server_status().await.unwrap().used_space, 5);

        // deletes give space back
        catalog
            .increment_cell_usage(CellId::new(0), -5, -1)
            .await
            .unwrap();
        catalog.increment_server_usage(-5).await.unwrap();

        let cells = catalog.list_cells().await.unwrap();
        assert_eq!(cells[0].free_space, 100);
        assert_eq!(cells[0].number_of_files, 0);
        assert_eq!(catalog.get_server_status().await.unwrap().used_space, 0);
    }

    #[tokio::test]
    async fn test_delete_directory_entry_idempotent() {
        let catalog = MemCatalog::new();
        catalog.initialize_server_status(test_init()).await.unwrap();

        let entry = DirectoryEntry {
            category: Category::default(),
            path: key("banana"),
            cell_id: CellId::new(0),
        };
        catalog.insert_directory_entry(&entry).await.unwrap();

        assert!(catalog
            .delete_directory_entry(&Category::default(), &key("banana"))
            .await
            .unwrap());
        // a second delete of the same key is success with no state change,
        // and only the first reports a removal
        assert!(!catalog
            .delete_directory_entry(&Category::default(), &key("banana"))
            .await
            .unwrap());
        assert_eq!(
            catalog
                .get_cell_for_key(&Category::default(), &key("banana"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_add_remove_cell() {
        let catalog = MemCatalog::new();
        catalog.initialize_server_status(test_init()).await.unwrap();

        catalog.add_cell(CellId::new(1), 100).await.unwrap();
        assert_matches!(
            catalog.add_cell(CellId::new(1), 100).await,
            Err(Error::CellExists { .. })
        );

        catalog.remove_cell(CellId::new(1)).await.unwrap();
        assert_matches!(
            catalog.remove_cell(CellId::new(1)).await,
            Err(Error::CellNotFound { .. })
        );
    }

    mod properties {
        use std::collections::HashMap;

        use proptest::prelude::*;

        use super::*;

        const CAPACITY: u64 = 100;

        #[derive(Debug, Clone)]
        enum Op {
            /// Bind a fresh key of the given size wherever it fits, updating
            /// the occupancy counters the way a placement does.
            Place(usize, u64),
            /// Unbind a key and release its occupancy.
            Remove(usize),
            /// Add a cell row and grow the singleton's totals.
            Grow,
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (0..8usize, 1..40u64).prop_map(|(k, size)| Op::Place(k, size)),
                2 => (0..8usize).prop_map(Op::Remove),
                1 => Just(Op::Grow),
            ]
        }

        /// For any workload of placements, removals and fleet growth applied
        /// with the callers' paired-update discipline: `used_space` equals
        /// the summed per-cell occupancy, `total_space` the summed
        /// capacities, the free-space search reports the lowest fitting
        /// ordinal, and no `(category, path)` is ever double-bound.
        #[test]
        fn prop_occupancy_and_directory_invariants() {
            let mut runner = proptest::test_runner::TestRunner::default();
            runner
                .run(
                    &proptest::collection::vec(op_strategy(), 1..50),
                    |ops| {
                        let rt = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("runtime construction");
                        rt.block_on(check_workload(ops));
                        Ok(())
                    },
                )
                .unwrap();
        }

        async fn check_workload(ops: Vec<Op>) {
            let catalog = MemCatalog::new();
            catalog.initialize_server_status(test_init()).await.unwrap();

            // model of what is bound where
            let mut placed: HashMap<String, (CellId, u64)> = HashMap::new();

            for op in ops {
                match op {
                    Op::Place(k, size) => {
                        let name = format!("key{k}");
                        let cell = match catalog
                            .find_cell_with_at_least(size, None)
                            .await
                            .unwrap()
                        {
                            Some(cell) => cell,
                            None => continue,
                        };
                        let entry = DirectoryEntry {
                            category: Category::default(),
                            path: key(&name),
                            cell_id: cell,
                        };
                        match catalog.insert_directory_entry(&entry).await {
                            Ok(()) => {
                                catalog
                                    .increment_cell_usage(cell, size as i64, 1)
                                    .await
                                    .unwrap();
                                catalog.increment_server_usage(size as i64).await.unwrap();
                                placed.insert(name, (cell, size));
                            }
                            // a duplicate insert loses and changes nothing
                            Err(Error::EntryExists { .. }) => {
                                assert!(placed.contains_key(&name));
                            }
                            Err(e) => panic!("unexpected insert error: {e}"),
                        }
                    }
                    Op::Remove(k) => {
                        let name = format!("key{k}");
                        let removed = catalog
                            .delete_directory_entry(&Category::default(), &key(&name))
                            .await
                            .unwrap();
                        match placed.remove(&name) {
                            Some((cell, size)) => {
                                assert!(removed);
                                catalog
                                    .increment_cell_usage(cell, -(size as i64), -1)
                                    .await
                                    .unwrap();
                                catalog
                                    .increment_server_usage(-(size as i64))
                                    .await
                                    .unwrap();
                            }
                            None => assert!(!removed),
                        }
                    }
                    Op::Grow => {
                        let status = catalog.get_server_status().await.unwrap();
                        catalog
                            .add_cell(CellId::new(status.number_of_cells), CAPACITY)
                            .await
                            .unwrap();
                        catalog
                            .update_server_status(ServerStatusUpdate {
                                number_of_cells: Some(status.number_of_cells + 1),
                                total_space: Some(status.total_space + CAPACITY),
                                ..Default::default()
                            })
                            .await
                            .unwrap();
                    }
                }

                let status = catalog.get_server_status().await.unwrap();
                let cells = catalog.list_cells().await.unwrap();

                // used space equals the summed per-cell occupancy, total
                // space the summed capacities
                let occupied: u64 = cells.iter().map(|c| c.capacity - c.free_space).sum();
                assert_eq!(status.used_space, occupied);
                let total: u64 = cells.iter().map(|c| c.capacity).sum();
                assert_eq!(status.total_space, total);
                assert_eq!(cells.len() as u32, status.number_of_cells);

                // the free-space search reports the lowest fitting ordinal
                if let Some(found) =
                    catalog.find_cell_with_at_least(1, None).await.unwrap()
                {
                    let first = cells
                        .iter()
                        .find(|c| c.free_space >= 1)
                        .map(|c| c.id)
                        .unwrap();
                    assert_eq!(found, first);
                }
            }

            // every binding matches the model and points at a live cell
            let cells = catalog.list_cells().await.unwrap();
            for (name, (cell, _)) in &placed {
                let bound = catalog
                    .get_cell_for_key(&Category::default(), &key(name))
                    .await
                    .unwrap();
                assert_eq!(bound, Some(*cell));
                assert!(cells.iter().any(|c| c.id == *cell));
            }
        }
    }
}
