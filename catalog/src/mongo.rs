//! The production catalog over a MongoDB document store.
//!
//! Database `service`, collections `serverstatus` (singleton, id 0),
//! `cellstatus` (one document per cell, id = ordinal) and `directories`
//! (one document per key, unique compound index on `(category, path)`).
//! Counter updates use the store's atomic `$inc`; directory rewrites filter
//! on the previously observed cell.

use async_trait::async_trait;
use data_types::{
    Category, CellId, CellStatus, DirectoryEntry, KeyPath, ServerStatus, ServerStatusUpdate,
};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    options::{ClientOptions, FindOneOptions, FindOptions, IndexOptions},
    Client, Collection, IndexModel,
};
use observability_deps::tracing::info;
use serde::{Deserialize, Serialize};

use crate::interface::{Catalog, Error, InitialStatus, Result};

/// Name of the catalog database.
pub const CATALOG_DB_NAME: &str = "service";

const SERVER_STATUS_ID: i32 = 0;

#[derive(Debug, Serialize, Deserialize)]
struct ServerStatusDoc {
    #[serde(rename = "_id")]
    id: i32,
    numberofcells: i64,
    totalspace: i64,
    usedspace: i64,
    suthreshold: i64,
    sdthreshold: i64,
    cellnameprefix: String,
    cellservicename: String,
}

impl From<ServerStatusDoc> for ServerStatus {
    fn from(doc: ServerStatusDoc) -> Self {
        Self {
            number_of_cells: doc.numberofcells as u32,
            total_space: doc.totalspace as u64,
            used_space: doc.usedspace as u64,
            scale_up_threshold: doc.suthreshold as u64,
            scale_down_threshold: doc.sdthreshold as u64,
            cell_name_prefix: doc.cellnameprefix,
            cell_service_name: doc.cellservicename,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CellStatusDoc {
    #[serde(rename = "_id")]
    id: i64,
    capacity: i64,
    freespace: i64,
    numberoffiles: i64,
}

impl From<CellStatusDoc> for CellStatus {
    fn from(doc: CellStatusDoc) -> Self {
        Self {
            id: CellId::new(doc.id as u32),
            capacity: doc.capacity as u64,
            free_space: doc.freespace.max(0) as u64,
            number_of_files: doc.numberoffiles.max(0) as u64,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DirectoryDoc {
    category: String,
    path: String,
    cellid: i64,
}

/// A [`Catalog`] over a MongoDB deployment.
#[derive(Debug)]
pub struct MongoCatalog {
    serverstatus: Collection<ServerStatusDoc>,
    cellstatus: Collection<CellStatusDoc>,
    directories: Collection<DirectoryDoc>,
    db: mongodb::Database,
}

impl MongoCatalog {
    /// Connect to the catalog at `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let uri = format!("mongodb://{host}:{port}");
        info!(%uri, "connecting to catalog");
        let options = ClientOptions::parse(&uri).await?;
        let client = Client::with_options(options)?;
        let db = client.database(CATALOG_DB_NAME);
        Ok(Self {
            serverstatus: db.collection("serverstatus"),
            cellstatus: db.collection("cellstatus"),
            directories: db.collection("directories"),
            db,
        })
    }

    fn directory_filter(category: &Category, path: &KeyPath) -> Document {
        doc! { "category": category.as_str(), "path": path.as_str() }
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(e: mongodb::error::Error) -> Self {
        Self::External {
            source: Box::new(e),
        }
    }
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    matches!(
        e.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11000
    )
}

#[async_trait]
impl Catalog for MongoCatalog {
    async fn setup(&self) -> Result<()> {
        // fail fast when the store is unreachable
        self.db.run_command(doc! { "ping": 1 }, None).await?;

        self.directories
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "category": 1, "path": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                None,
            )
            .await?;
        Ok(())
    }

    async fn get_server_status(&self) -> Result<ServerStatus> {
        self.serverstatus
            .find_one(doc! { "_id": SERVER_STATUS_ID }, None)
            .await?
            .map(Into::into)
            .ok_or(Error::NotInitialized)
    }

    async fn initialize_server_status(&self, init: InitialStatus) -> Result<ServerStatus> {
        let status_doc = ServerStatusDoc {
            id: SERVER_STATUS_ID,
            numberofcells: 1,
            totalspace: init.cell_capacity as i64,
            usedspace: 0,
            suthreshold: init.scale_up_threshold as i64,
            sdthreshold: init.scale_down_threshold as i64,
            cellnameprefix: init.cell_name_prefix,
            cellservicename: init.cell_service_name,
        };

        self.serverstatus
            .insert_one(&status_doc, None)
            .await
            .map_err(|e| {
                if is_duplicate_key(&e) {
                    Error::AlreadyInitialized
                } else {
                    e.into()
                }
            })?;

        // losing the race on the first cell row means another controller
        // initialized concurrently; the singleton insert above is the gate
        let first_cell = CellStatusDoc {
            id: 0,
            capacity: init.cell_capacity as i64,
            freespace: init.cell_capacity as i64,
            numberoffiles: 0,
        };
        if let Err(e) = self.cellstatus.insert_one(&first_cell, None).await {
            if !is_duplicate_key(&e) {
                return Err(e.into());
            }
        }

        Ok(status_doc.into())
    }

    async fn update_server_status(&self, update: ServerStatusUpdate) -> Result<()> {
        let mut set = Document::new();
        if let Some(v) = update.number_of_cells {
            set.insert("numberofcells", v as i64);
        }
        if let Some(v) = update.total_space {
            set.insert("totalspace", v as i64);
        }
        if let Some(v) = update.scale_up_threshold {
            set.insert("suthreshold", v as i64);
        }
        if let Some(v) = update.scale_down_threshold {
            set.insert("sdthreshold", v as i64);
        }
        if set.is_empty() {
            return Ok(());
        }

        let updated = self
            .serverstatus
            .update_one(doc! { "_id": SERVER_STATUS_ID }, doc! { "$set": set }, None)
            .await?;
        if updated.matched_count == 0 {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    async fn find_cell_with_at_least(
        &self,
        bytes: u64,
        exclude: Option<CellId>,
    ) -> Result<Option<CellId>> {
        let mut filter = doc! { "freespace": { "$gte": bytes as i64 } };
        if let Some(exclude) = exclude {
            filter.insert("_id", doc! { "$ne": exclude.get() as i64 });
        }

        let found = self
            .cellstatus
            .find_one(
                filter,
                FindOneOptions::builder().sort(doc! { "_id": 1 }).build(),
            )
            .await?;
        Ok(found.map(|doc| CellId::new(doc.id as u32)))
    }

    async fn get_cell_for_key(
        &self,
        category: &Category,
        path: &KeyPath,
    ) -> Result<Option<CellId>> {
        let found = self
            .directories
            .find_one(Self::directory_filter(category, path), None)
            .await?;
        Ok(found.map(|doc| CellId::new(doc.cellid as u32)))
    }

    async fn insert_directory_entry(&self, entry: &DirectoryEntry) -> Result<()> {
        let doc = DirectoryDoc {
            category: entry.category.as_str().to_string(),
            path: entry.path.as_str().to_string(),
            cellid: entry.cell_id.get() as i64,
        };
        self.directories.insert_one(&doc, None).await.map_err(|e| {
            if is_duplicate_key(&e) {
                Error::EntryExists {
                    category: entry.category.clone(),
                    path: entry.path.clone(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn update_directory_entry_cell(
        &self,
        category: &Category,
        path: &KeyPath,
        old_cell: CellId,
        new_cell: CellId,
    ) -> Result<()> {
        let mut filter = Self::directory_filter(category, path);
        filter.insert("cellid", old_cell.get() as i64);

        let updated = self
            .directories
            .update_one(
                filter,
                doc! { "$set": { "cellid": new_cell.get() as i64 } },
                None,
            )
            .await?;
        if updated.matched_count == 0 {
            return Err(Error::EntryNotFound {
                category: category.clone(),
                path: path.clone(),
            });
        }
        Ok(())
    }

    async fn delete_directory_entry(&self, category: &Category, path: &KeyPath) -> Result<bool> {
        let deleted = self
            .directories
            .delete_one(Self::directory_filter(category, path), None)
            .await?;
        Ok(deleted.deleted_count > 0)
    }

    async fn increment_cell_usage(
        &self,
        id: CellId,
        delta_bytes: i64,
        delta_files: i64,
    ) -> Result<()> {
        let updated = self
            .cellstatus
            .update_one(
                doc! { "_id": id.get() as i64 },
                doc! { "$inc": { "freespace": -delta_bytes, "numberoffiles": delta_files } },
                None,
            )
            .await?;
        if updated.matched_count == 0 {
            return Err(Error::CellNotFound { id });
        }
        Ok(())
    }

    async fn increment_server_usage(&self, delta_bytes: i64) -> Result<()> {
        let updated = self
            .serverstatus
            .update_one(
                doc! { "_id": SERVER_STATUS_ID },
                doc! { "$inc": { "usedspace": delta_bytes } },
                None,
            )
            .await?;
        if updated.matched_count == 0 {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    async fn add_cell(&self, id: CellId, capacity: u64) -> Result<()> {
        let doc = CellStatusDoc {
            id: id.get() as i64,
            capacity: capacity as i64,
            freespace: capacity as i64,
            numberoffiles: 0,
        };
        self.cellstatus.insert_one(&doc, None).await.map_err(|e| {
            if is_duplicate_key(&e) {
                Error::CellExists { id }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn remove_cell(&self, id: CellId) -> Result<()> {
        let deleted = self
            .cellstatus
            .delete_one(doc! { "_id": id.get() as i64 }, None)
            .await?;
        if deleted.deleted_count == 0 {
            return Err(Error::CellNotFound { id });
        }
        Ok(())
    }

    async fn list_cells(&self) -> Result<Vec<CellStatus>> {
        let cursor = self
            .cellstatus
            .find(
                None,
                FindOptions::builder().sort(doc! { "_id": 1 }).build(),
            )
            .await?;
        let docs: Vec<CellStatusDoc> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(Into::into).collect())
    }
}
