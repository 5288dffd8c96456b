//! The external HTTP API.
//!
//! All responses are `application/json; charset=UTF-8`. Following the
//! service's historical behaviour, request-level failures are answered as
//! `200` with an error body rather than an error status; only unknown routes
//! get a `404`.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use catalog::interface::Catalog;
use cell_client::{Cell, CellFleet};
use data_types::{decode_path_segment, Category, CellStatus, KeyPath};
use futures::future;
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use observability_deps::tracing::{debug, error, info, warn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::placement::{PlacementEngine, PlacementError};

const CONTENT_TYPE_JSON: &str = "application/json; charset=UTF-8";

/// Routes requests of the external API onto the placement engine and the
/// catalog.
#[derive(Debug)]
pub struct HttpDelegate {
    placement: PlacementEngine,
    catalog: Arc<dyn Catalog>,
    fleet: Arc<dyn CellFleet>,
}

impl HttpDelegate {
    /// Create a delegate over the given placement engine and catalog.
    pub fn new(
        placement: PlacementEngine,
        catalog: Arc<dyn Catalog>,
        fleet: Arc<dyn CellFleet>,
    ) -> Self {
        Self {
            placement,
            catalog,
            fleet,
        }
    }

    /// Dispatch `req`, always producing a response.
    pub async fn route(&self, req: Request<Body>) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path
            .trim_start_matches('/')
            .trim_end_matches('/')
            .split('/')
            .collect();

        match (method, segments.as_slice()) {
            (Method::GET, ["healthcheck"]) => json_response(json!({ "status": "alive" })),
            (Method::GET, ["status"]) => self.status().await,
            (Method::PUT, [id, info]) => self.put(id, info).await,
            (Method::GET, [id, _info]) => self.get(id).await,
            (Method::DELETE, [id, _info]) => self.delete(id).await,
            _ => {
                debug!(%path, "no route matches");
                not_found_response()
            }
        }
    }

    async fn put(&self, id: &str, info: &str) -> Response<Body> {
        let (path, payload) = match (decode_key(id), decode_path_segment(info)) {
            (Ok(path), Ok(payload)) => (path, payload),
            (Err(e), _) => return error_response(&e),
            (_, Err(e)) => return error_response(&e.to_string()),
        };

        match self
            .placement
            .put(&Category::default(), &path, &payload)
            .await
        {
            Ok(bytes) => json_response(json!({ "result": "OK", "bytes": bytes })),
            Err(PlacementError::CapacityUnavailable { size }) => {
                // not an error: the client is expected to retry
                info!(key = %path, size, "no capacity for write");
                error_response("Try later")
            }
            Err(e @ PlacementError::Conflict { .. }) => error_response(&e.to_string()),
            Err(e @ PlacementError::StateViolation(_)) => {
                error!(key = %path, error = %e, "write failed on invariant violation");
                error_response("Server error")
            }
            Err(e) => {
                warn!(key = %path, error = %e, "write failed");
                error_response(&e.to_string())
            }
        }
    }

    async fn get(&self, id: &str) -> Response<Body> {
        let path = match decode_key(id) {
            Ok(path) => path,
            Err(e) => return error_response(&e),
        };

        match self.placement.get(&Category::default(), &path).await {
            Ok(payload) => json_response(json!({ "result": payload })),
            Err(e @ PlacementError::NotFound { .. }) => error_response(&e.to_string()),
            Err(e @ PlacementError::StateViolation(_)) => {
                error!(key = %path, error = %e, "read failed on invariant violation");
                error_response("Server error")
            }
            Err(e) => {
                warn!(key = %path, error = %e, "read failed");
                error_response(&e.to_string())
            }
        }
    }

    async fn delete(&self, id: &str) -> Response<Body> {
        let path = match decode_key(id) {
            Ok(path) => path,
            Err(e) => return error_response(&e),
        };

        match self.placement.delete(&Category::default(), &path).await {
            Ok(()) => json_response(json!({ "result": "success" })),
            Err(e @ PlacementError::NotFound { .. }) => error_response(&e.to_string()),
            Err(e) => {
                warn!(key = %path, error = %e, "delete failed");
                error_response(&e.to_string())
            }
        }
    }

    async fn status(&self) -> Response<Body> {
        let status = match self.catalog.get_server_status().await {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "status read failed");
                return error_response("Server error");
            }
        };

        let cells = match self.catalog.list_cells().await {
            Ok(cells) => cells,
            Err(e) => {
                error!(error = %e, "cell listing failed");
                return error_response("Server error");
            }
        };
        let cells_alive = self.count_alive(&cells).await;

        json_response(json!({
            "revision": env!("CARGO_PKG_VERSION"),
            "cells-alive": cells_alive,
            "numberofcells": status.number_of_cells,
            "totalspace": status.total_space,
            "usedspace": status.used_space,
            "suthreshold": status.scale_up_threshold,
            "sdthreshold": status.scale_down_threshold,
        }))
    }

    async fn count_alive(&self, cells: &[CellStatus]) -> usize {
        let probes = cells
            .iter()
            .map(|cell| self.fleet.cell(cell.id))
            .map(|cell| async move { cell.health().await.is_ok() });
        future::join_all(probes)
            .await
            .into_iter()
            .filter(|alive| *alive)
            .count()
    }
}

fn decode_key(id: &str) -> Result<KeyPath, String> {
    let decoded = decode_path_segment(id).map_err(|e| e.to_string())?;
    KeyPath::try_new(decoded).map_err(|e| e.to_string())
}

fn json_response(body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
        .body(Body::from(body.to_string()))
        .expect("building response with valid parts")
}

fn error_response(msg: &str) -> Response<Body> {
    json_response(json!({ "error": msg }))
}

fn not_found_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
        .body(Body::from(json!({ "error": "no such route" }).to_string()))
        .expect("building response with valid parts")
}

/// Serve the external API on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    delegate: Arc<HttpDelegate>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let delegate = Arc::clone(&delegate);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let delegate = Arc::clone(&delegate);
                async move { Ok::<_, Infallible>(delegate.route(req).await) }
            }))
        }
    });

    info!(%addr, "router listening");
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use catalog::{interface::InitialStatus, mem::MemCatalog};
    use cell_client::mock::MockFleet;
    use orchestrator::mock::MockOrchestrator;
    use pretty_assertions::assert_eq;
    use scaler::{Scaler, ScalerConfig};

    use super::*;

    const CAPACITY: u64 = 100;

    async fn test_delegate() -> HttpDelegate {
        let catalog = Arc::new(MemCatalog::new());
        catalog
            .initialize_server_status(InitialStatus {
                cell_capacity: CAPACITY,
                scale_up_threshold: 30,
                scale_down_threshold: 60,
                cell_name_prefix: "storagecells-sts".to_string(),
                cell_service_name: "storage-cells-service".to_string(),
            })
            .await
            .unwrap();
        let fleet = MockFleet::new(CAPACITY);
        let orchestrator = Arc::new(MockOrchestrator::new(1));

        let (scaler, handle) = Scaler::new(
            ScalerConfig::new(CAPACITY),
            Arc::clone(&catalog) as _,
            Arc::clone(&fleet) as _,
            orchestrator as _,
        );
        tokio::spawn(scaler.run());

        let placement = PlacementEngine::new(
            Arc::clone(&catalog) as _,
            Arc::clone(&fleet) as _,
            handle,
        );
        HttpDelegate::new(placement, catalog as _, fleet as _)
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        assert_eq!(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some(CONTENT_TYPE_JSON)
        );
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let delegate = test_delegate().await;
        let response = delegate.route(request(Method::GET, "/healthcheck")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "status": "alive" })
        );
    }

    /// A 5 byte write is acknowledged with its size and read back verbatim.
    #[tokio::test]
    async fn test_put_get_round_trip() {
        let delegate = test_delegate().await;

        let response = delegate.route(request(Method::PUT, "/a/xxxxx")).await;
        assert_eq!(
            body_json(response).await,
            json!({ "result": "OK", "bytes": 5 })
        );

        let response = delegate.route(request(Method::GET, "/a/_")).await;
        assert_eq!(body_json(response).await, json!({ "result": "xxxxx" }));

        let response = delegate.route(request(Method::GET, "/status")).await;
        let status = body_json(response).await;
        assert_eq!(status["numberofcells"], 1);
        assert_eq!(status["usedspace"], 5);
        assert_eq!(status["totalspace"], 100);
        assert_eq!(status["cells-alive"], 1);
    }

    /// Reading an unknown key is an error body with no side effects.
    #[tokio::test]
    async fn test_get_unknown_key() {
        let delegate = test_delegate().await;

        let response = delegate.route(request(Method::GET, "/nope/_")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("not found"));

        let response = delegate.route(request(Method::GET, "/status")).await;
        assert_eq!(body_json(response).await["usedspace"], 0);
    }

    #[tokio::test]
    async fn test_delete_round_trip() {
        let delegate = test_delegate().await;

        delegate.route(request(Method::PUT, "/a/xxxxx")).await;
        let response = delegate.route(request(Method::DELETE, "/a/_")).await;
        assert_eq!(body_json(response).await, json!({ "result": "success" }));

        // the key is gone, and so is its accounting
        let response = delegate.route(request(Method::DELETE, "/a/_")).await;
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("not found"));

        let response = delegate.route(request(Method::GET, "/status")).await;
        assert_eq!(body_json(response).await["usedspace"], 0);
    }

    #[tokio::test]
    async fn test_put_duplicate_is_conflict() {
        let delegate = test_delegate().await;

        delegate.route(request(Method::PUT, "/a/xxxxx")).await;
        let response = delegate.route(request(Method::PUT, "/a/yyyyy")).await;
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("already exists"));

        // the original value is untouched
        let response = delegate.route(request(Method::GET, "/a/_")).await;
        assert_eq!(body_json(response).await, json!({ "result": "xxxxx" }));
    }

    #[tokio::test]
    async fn test_put_without_capacity_is_try_later() {
        let delegate = test_delegate().await;

        let long_value = "x".repeat(CAPACITY as usize + 1);
        let response = delegate
            .route(request(Method::PUT, &format!("/a/{long_value}")))
            .await;
        assert_eq!(body_json(response).await, json!({ "error": "Try later" }));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let delegate = test_delegate().await;
        let response = delegate.route(request(Method::GET, "/a/b/c/d")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// Percent-encoded key and payload segments are decoded before use.
    #[tokio::test]
    async fn test_percent_encoded_segments() {
        let delegate = test_delegate().await;

        let response = delegate
            .route(request(Method::PUT, "/hello%20key/a%20b"))
            .await;
        assert_eq!(
            body_json(response).await,
            json!({ "result": "OK", "bytes": 3 })
        );

        let response = delegate.route(request(Method::GET, "/hello%20key/_")).await;
        assert_eq!(body_json(response).await, json!({ "result": "a b" }));
    }
}
