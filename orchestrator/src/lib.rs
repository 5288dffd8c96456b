//! Driver for the external workload orchestrator.
//!
//! The orchestrator reconciles a desired replica count of an ordered replica
//! set and owns per-replica persistent volumes. This crate is the only place
//! allowed to talk to it: the elasticity controller requests a new desired
//! size, waits for a specific replica ordinal to reach a lifecycle phase, and
//! prunes volumes orphaned by prior shrinks.
//!
//! Reconciliation is slow - a new replica takes seconds to become healthy -
//! so phase waits poll with a bounded backoff rather than watching.

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

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig, BackoffError};
use data_types::CellId;
use thiserror::Error;

mod kube;
pub mod mock;

pub use kube::KubeApiOrchestrator;

/// Errors returned by orchestrator calls.
#[derive(Debug, Error)]
pub enum Error {
    /// The orchestrator API call failed at the transport level.
    #[error("orchestrator request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The orchestrator answered with an unexpected status.
    #[error("orchestrator returned HTTP {status}: `{text}`")]
    UnexpectedResponse {
        /// The status code of the unexpected response.
        status: reqwest::StatusCode,
        /// The response body, for the log.
        text: String,
    },

    /// The orchestrator's response did not parse.
    #[error("malformed orchestrator response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

/// The lifecycle phase of one replica of the ordered replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPhase {
    /// The replica exists and is serving.
    Running,
    /// The replica exists but is not (yet) serving.
    Pending,
    /// No replica exists at this ordinal.
    Absent,
}

/// Operations on the external workload orchestrator.
///
/// `scale_to` returns when the request is *accepted*, not when it is
/// reconciled; pair it with [`wait_for_replica`].
#[async_trait]
pub trait Orchestrator: Debug + Send + Sync {
    /// Request the ordered replica set's desired size.
    async fn scale_to(&self, replicas: u32) -> Result<(), Error>;

    /// Observe the current phase of the replica at `ordinal`.
    async fn replica_phase(&self, ordinal: CellId) -> Result<ReplicaPhase, Error>;

    /// Delete persistent volumes with ordinal >= `keep` left over from prior
    /// shrinks.
    async fn prune_volumes(&self, keep: u32) -> Result<(), Error>;
}

/// Why a [`wait_for_replica`] attempt did not complete.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The replica was observed, but not yet in the requested phase.
    #[error("replica {ordinal} observed in phase {observed:?}, waiting for {target:?}")]
    PhaseMismatch {
        /// The replica being waited on.
        ordinal: CellId,
        /// The phase it was observed in.
        observed: ReplicaPhase,
        /// The phase being waited for.
        target: ReplicaPhase,
    },

    /// The phase observation itself failed.
    #[error(transparent)]
    Driver(#[from] Error),
}

/// The polling cadence mandated for replica phase waits: no tighter than 5 s
/// initially, on the order of 10 s between polls, bounded overall.
pub fn replica_poll_backoff() -> BackoffConfig {
    BackoffConfig {
        init_backoff: Duration::from_secs(5),
        max_backoff: Duration::from_secs(10),
        base: 1.5,
        deadline: Some(Duration::from_secs(300)),
    }
}

/// Poll until the replica at `ordinal` is observed in `target` phase.
///
/// Transport errors are retried like phase mismatches; the deadline in
/// `config` bounds the whole wait.
pub async fn wait_for_replica(
    orchestrator: &dyn Orchestrator,
    ordinal: CellId,
    target: ReplicaPhase,
    config: &BackoffConfig,
) -> Result<(), BackoffError<WaitError>> {
    Backoff::new(config)
        .retry_all_errors("wait for replica phase", || async move {
            let observed = orchestrator
                .replica_phase(ordinal)
                .await
                .map_err(WaitError::Driver)?;
            if observed == target {
                Ok(())
            } else {
                Err(WaitError::PhaseMismatch {
                    ordinal,
                    observed,
                    target,
                })
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::{mock::MockOrchestrator, *};

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_replica_polls_until_running() {
        test_helpers::maybe_start_logging();

        let orchestrator = std::sync::Arc::new(MockOrchestrator::new(1));
        orchestrator.pin_phase(CellId::new(1), ReplicaPhase::Pending);

        let flip = std::sync::Arc::clone(&orchestrator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            flip.pin_phase(CellId::new(1), ReplicaPhase::Running);
        });

        wait_for_replica(
            orchestrator.as_ref(),
            CellId::new(1),
            ReplicaPhase::Running,
            &replica_poll_backoff(),
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_replica_deadline() {
        let orchestrator = MockOrchestrator::new(1);
        orchestrator.pin_phase(CellId::new(1), ReplicaPhase::Pending);

        let err = wait_for_replica(
            &orchestrator,
            CellId::new(1),
            ReplicaPhase::Running,
            &BackoffConfig {
                init_backoff: Duration::from_secs(5),
                max_backoff: Duration::from_secs(10),
                base: 1.5,
                deadline: Some(Duration::from_secs(30)),
            },
        )
        .await
        .unwrap_err();

        assert!(
            matches!(err, BackoffError::DeadlineExceeded { .. }),
            "{err}"
        );
    }
}
