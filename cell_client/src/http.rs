//! The production [`Cell`] implementation over HTTP.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use data_types::{encode_path_segment, CellAddressing, CellId, KeyPath};
use observability_deps::tracing::debug;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use snafu::ResultExt;

use crate::{
    Cell, CellContents, CellFleet, ContentItem, DeserializingSnafu, ReqwestProcessingSnafu,
    RequestError,
};

/// Default per-request timeout for cell calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A [`CellFleet`] deriving cell base URLs from the replica naming scheme.
#[derive(Debug, Clone)]
pub struct HttpCellFleet {
    addressing: CellAddressing,
    client: reqwest::Client,
}

impl HttpCellFleet {
    /// Create a fleet over `addressing` with the given per-request timeout.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialised.
    pub fn new(addressing: CellAddressing, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // cell connections are short-lived; do not keep idle sockets to
            // replicas that may be about to disappear
            .pool_max_idle_per_host(0)
            .build()
            .expect("failed to construct cell http client");

        Self { addressing, client }
    }
}

impl CellFleet for HttpCellFleet {
    fn cell(&self, id: CellId) -> Arc<dyn Cell> {
        Arc::new(HttpCell {
            cell_id: id,
            url: self.addressing.url(id),
            client: self.client.clone(),
        })
    }
}

/// A connection to one cell, addressed by ordinal.
#[derive(Debug, Clone)]
pub struct HttpCell {
    cell_id: CellId,
    url: String,
    client: reqwest::Client,
}

impl HttpCell {
    /// A connection to the cell serving at `url` directly, bypassing the
    /// fleet addressing. Used by tests.
    pub fn with_url(cell_id: CellId, url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            cell_id,
            url: url.into(),
            client,
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::Response, RequestError> {
        let url = format!("{}{}", self.url, path);
        debug!(cell_id = %self.cell_id, %method, %url, "cell request");
        self.client
            .request(method, &url)
            .send()
            .await
            .context(ReqwestProcessingSnafu)
    }
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    result: String,
}

#[derive(Debug, Deserialize)]
struct ContentsBody {
    result: ContentsResult,
}

#[derive(Debug, Deserialize)]
struct ContentsResult {
    free: u64,
    storage: Vec<StorageItem>,
}

#[derive(Debug, Deserialize)]
struct StorageItem {
    id: String,
    size: u64,
}

#[async_trait]
impl Cell for HttpCell {
    async fn get(&self, path: &KeyPath) -> Result<String, RequestError> {
        let response = self
            .send(Method::GET, &format!("/{}/_", path.as_path_segment()))
            .await?;

        match response.status() {
            StatusCode::OK => {
                let text = response.text().await.context(ReqwestProcessingSnafu)?;
                let body: ResultBody =
                    serde_json::from_str(&text).context(DeserializingSnafu { text })?;
                Ok(body.result)
            }
            StatusCode::NOT_FOUND => Err(RequestError::KeyNotFound {
                cell_id: self.cell_id,
                path: path.clone(),
            }),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(RequestError::Http { status, text })
            }
        }
    }

    async fn put(&self, path: &KeyPath, payload: &str) -> Result<(), RequestError> {
        let response = self
            .send(
                Method::POST,
                &format!("/{}/{}", path.as_path_segment(), encode_path_segment(payload)),
            )
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::INSUFFICIENT_STORAGE => Err(RequestError::CellFull {
                cell_id: self.cell_id,
                size: payload.len() as u64,
            }),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(RequestError::Http { status, text })
            }
        }
    }

    async fn delete(&self, path: &KeyPath) -> Result<(), RequestError> {
        let response = self
            .send(Method::DELETE, &format!("/{}/_", path.as_path_segment()))
            .await?;

        match response.status() {
            // removing an absent key is success
            StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(RequestError::Http { status, text })
            }
        }
    }

    async fn list_contents(&self) -> Result<CellContents, RequestError> {
        let response = self.send(Method::GET, "/contents").await?;

        match response.status() {
            StatusCode::OK => {
                let text = response.text().await.context(ReqwestProcessingSnafu)?;
                let body: ContentsBody =
                    serde_json::from_str(&text).context(DeserializingSnafu { text })?;
                Ok(CellContents {
                    free_space: body.result.free,
                    items: body
                        .result
                        .storage
                        .into_iter()
                        .map(|item| ContentItem {
                            id: item.id,
                            size: item.size,
                        })
                        .collect(),
                })
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(RequestError::Http { status, text })
            }
        }
    }

    async fn health(&self) -> Result<(), RequestError> {
        let response = self.send(Method::GET, "/healthcheck").await?;
        response
            .error_for_status()
            .map(drop)
            .context(ReqwestProcessingSnafu)
    }
}
