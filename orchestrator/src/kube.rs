//! The production [`Orchestrator`] over the cluster manager's REST API.

use data_types::CellId;
use observability_deps::tracing::{debug, info};
use reqwest::{header, StatusCode};
use serde_json::{json, Value};

use crate::{Error, Orchestrator, ReplicaPhase};

/// Prefix of the per-replica persistent volume claims, as created by the
/// replica set's volume template.
const VOLUME_PREFIX: &str = "data";

/// Drives an ordered replica set (a StatefulSet-shaped workload) through the
/// cluster manager's REST API: the scale subresource for desired size,
/// per-replica pod reads for lifecycle phases, and volume claim deletes for
/// pruning.
#[derive(Debug)]
pub struct KubeApiOrchestrator {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    set_name: String,
}

impl KubeApiOrchestrator {
    /// Create a driver for the replica set `set_name` in `namespace`, served
    /// at `base_url`.
    ///
    /// `token` is the bearer token of the service account the controller runs
    /// as; `ca_pem` an optional additional root certificate for the API
    /// endpoint.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be constructed from the provided
    /// certificate material.
    pub fn new(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        token: Option<&str>,
        ca_pem: Option<&[u8]>,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = token {
            let mut value = header::HeaderValue::try_from(format!("Bearer {token}"))
                .expect("invalid orchestrator token");
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30));
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem).expect("invalid orchestrator CA");
            builder = builder.add_root_certificate(cert);
        }

        Self {
            client: builder.build().expect("failed to construct orchestrator client"),
            base_url: base_url.into(),
            namespace: namespace.into(),
            set_name: set_name.into(),
        }
    }

    fn scale_url(&self) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/statefulsets/{}/scale",
            self.base_url, self.namespace, self.set_name
        )
    }

    fn pod_url(&self, ordinal: CellId) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods/{}-{}",
            self.base_url, self.namespace, self.set_name, ordinal
        )
    }

    fn volume_claims_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/persistentvolumeclaims",
            self.base_url, self.namespace
        )
    }

    async fn expect_2xx(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(Error::UnexpectedResponse { status, text })
    }
}

#[async_trait::async_trait]
impl Orchestrator for KubeApiOrchestrator {
    async fn scale_to(&self, replicas: u32) -> Result<(), Error> {
        info!(set_name = %self.set_name, replicas, "requesting replica set scale");
        let response = self
            .client
            .patch(self.scale_url())
            .header(header::CONTENT_TYPE, "application/merge-patch+json")
            .json(&json!({ "spec": { "replicas": replicas } }))
            .send()
            .await?;
        Self::expect_2xx(response).await.map(drop)
    }

    async fn replica_phase(&self, ordinal: CellId) -> Result<ReplicaPhase, Error> {
        let response = self.client.get(self.pod_url(ordinal)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(ReplicaPhase::Absent);
        }

        let body: Value = Self::expect_2xx(response).await?.json().await?;
        let phase = body
            .pointer("/status/phase")
            .and_then(Value::as_str)
            .unwrap_or_default();
        debug!(%ordinal, phase, "observed replica phase");

        Ok(match phase {
            "Running" => ReplicaPhase::Running,
            _ => ReplicaPhase::Pending,
        })
    }

    async fn prune_volumes(&self, keep: u32) -> Result<(), Error> {
        let response = self.client.get(self.volume_claims_url()).send().await?;
        let body: Value = Self::expect_2xx(response).await?.json().await?;

        let claim_prefix = format!("{}-{}-", VOLUME_PREFIX, self.set_name);
        let orphaned: Vec<String> = body
            .pointer("/items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.pointer("/metadata/name").and_then(Value::as_str))
                    .filter(|name| {
                        name.strip_prefix(&claim_prefix)
                            .and_then(|ordinal| ordinal.parse::<u32>().ok())
                            .is_some_and(|ordinal| ordinal >= keep)
                    })
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        for name in orphaned {
            info!(claim = %name, "pruning orphaned persistent volume claim");
            let response = self
                .client
                .delete(format!("{}/{}", self.volume_claims_url(), name))
                .send()
                .await?;
            // already-gone claims are not an error
            if response.status() != StatusCode::NOT_FOUND {
                Self::expect_2xx(response).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_orchestrator(server: &mockito::ServerGuard) -> KubeApiOrchestrator {
        KubeApiOrchestrator::new(server.url(), "default", "storagecells-sts", None, None)
    }

    #[tokio::test]
    async fn test_scale_to() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "PATCH",
                "/apis/apps/v1/namespaces/default/statefulsets/storagecells-sts/scale",
            )
            .match_header("content-type", "application/merge-patch+json")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        test_orchestrator(&server).scale_to(2).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_replica_phase_absent_and_running() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/namespaces/default/pods/storagecells-sts-1")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/api/v1/namespaces/default/pods/storagecells-sts-0")
            .with_status(200)
            .with_body(r#"{"status":{"phase":"Running"}}"#)
            .create_async()
            .await;

        let orchestrator = test_orchestrator(&server);
        assert_eq!(
            orchestrator.replica_phase(CellId::new(1)).await.unwrap(),
            ReplicaPhase::Absent
        );
        assert_eq!(
            orchestrator.replica_phase(CellId::new(0)).await.unwrap(),
            ReplicaPhase::Running
        );
    }

    #[tokio::test]
    async fn test_prune_volumes_deletes_high_ordinals() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/namespaces/default/persistentvolumeclaims")
            .with_status(200)
            .with_body(
                r#"{"items":[
                    {"metadata":{"name":"data-storagecells-sts-0"}},
                    {"metadata":{"name":"data-storagecells-sts-2"}},
                    {"metadata":{"name":"unrelated-claim"}}
                ]}"#,
            )
            .create_async()
            .await;
        let delete = server
            .mock(
                "DELETE",
                "/api/v1/namespaces/default/persistentvolumeclaims/data-storagecells-sts-2",
            )
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        test_orchestrator(&server).prune_volumes(1).await.unwrap();
        delete.assert_async().await;
    }
}
