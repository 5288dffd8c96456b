//! The cell's HTTP surface, consumed only by the controller.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use data_types::decode_path_segment;
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use observability_deps::tracing::{debug, info};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::store::{KeyStore, StoreOutcome};

const CONTENT_TYPE_JSON: &str = "application/json; charset=UTF-8";

/// Routes the internal cell API onto the [`KeyStore`].
#[derive(Debug)]
pub struct CellDelegate {
    store: KeyStore,
}

impl CellDelegate {
    /// A delegate over a fresh store of `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            store: KeyStore::new(capacity),
        }
    }

    /// Dispatch `req`, always producing a response.
    pub fn route(&self, req: &Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path
            .trim_start_matches('/')
            .trim_end_matches('/')
            .split('/')
            .collect();

        match (req.method(), segments.as_slice()) {
            (&Method::GET, ["healthcheck"]) => json_response(json!({ "status": "alive" })),
            (&Method::GET, ["cellinfo"]) => {
                json_response(json!({ "available": self.store.free_space() }))
            }
            (&Method::GET, ["contents"]) => self.contents(),
            (&Method::POST, [id, info]) => self.store_item(id, info),
            (&Method::GET, [id, _info]) => self.retrieve_item(id),
            (&Method::DELETE, [id, _info]) => self.delete_item(id),
            _ => {
                debug!(%path, "no route matches");
                status_response(StatusCode::NOT_FOUND, json!({ "error": "no such route" }))
            }
        }
    }

    fn store_item(&self, id: &str, info: &str) -> Response<Body> {
        let (key, payload) = match (decode_path_segment(id), decode_path_segment(info)) {
            (Ok(key), Ok(payload)) => (key, payload),
            _ => {
                return status_response(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "malformed path segment" }),
                )
            }
        };

        match self.store.store(&key, &payload) {
            StoreOutcome::Stored | StoreOutcome::AlreadyPresent => {
                json_response(json!({ "result": "success" }))
            }
            StoreOutcome::Full => {
                debug!(key, size = payload.len(), "payload does not fit");
                status_response(StatusCode::INSUFFICIENT_STORAGE, json!({ "error": "full" }))
            }
        }
    }

    fn retrieve_item(&self, id: &str) -> Response<Body> {
        let key = match decode_path_segment(id) {
            Ok(key) => key,
            Err(_) => {
                return status_response(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "malformed path segment" }),
                )
            }
        };

        match self.store.retrieve(&key) {
            Some(payload) => json_response(json!({ "result": payload })),
            None => status_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })),
        }
    }

    fn delete_item(&self, id: &str) -> Response<Body> {
        let key = match decode_path_segment(id) {
            Ok(key) => key,
            Err(_) => {
                return status_response(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "malformed path segment" }),
                )
            }
        };

        if self.store.delete(&key) {
            json_response(json!({ "result": "success" }))
        } else {
            status_response(StatusCode::NOT_FOUND, json!({ "error": "not found" }))
        }
    }

    fn contents(&self) -> Response<Body> {
        let storage: Vec<_> = self
            .store
            .contents()
            .into_iter()
            .map(|(id, payload)| {
                json!({ "id": id, "size": payload.len(), "payload": payload })
            })
            .collect();

        json_response(json!({
            "result": { "free": self.store.free_space(), "storage": storage }
        }))
    }
}

fn json_response(body: serde_json::Value) -> Response<Body> {
    status_response(StatusCode::OK, body)
}

fn status_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
        .body(Body::from(body.to_string()))
        .expect("building response with valid parts")
}

/// Serve the cell API on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    delegate: Arc<CellDelegate>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let delegate = Arc::clone(&delegate);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let delegate = Arc::clone(&delegate);
                async move { Ok::<_, Infallible>(delegate.route(&req)) }
            }))
        }
    });

    info!(%addr, "storage cell listening");
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
