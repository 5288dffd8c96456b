//! A recording [`Orchestrator`] that reconciles instantly, for elasticity
//! tests.

use std::collections::HashMap;

use data_types::CellId;
use parking_lot::Mutex;

use crate::{Error, Orchestrator, ReplicaPhase};

#[derive(Debug, Default)]
struct MockState {
    desired: u32,
    pinned: HashMap<CellId, ReplicaPhase>,
    scale_calls: Vec<u32>,
    prune_calls: Vec<u32>,
    fail_scale: bool,
}

/// A mock orchestrator.
///
/// Unless a phase is pinned, replicas below the desired size report
/// `Running` and replicas at or above it report `Absent` - reconciliation is
/// instantaneous. Pin phases to exercise the polling paths.
#[derive(Debug)]
pub struct MockOrchestrator {
    state: Mutex<MockState>,
}

impl MockOrchestrator {
    /// A mock replica set with `desired` replicas already reconciled.
    pub fn new(desired: u32) -> Self {
        Self {
            state: Mutex::new(MockState {
                desired,
                ..Default::default()
            }),
        }
    }

    /// Pin the observed phase of `ordinal`, overriding auto-reconciliation.
    pub fn pin_phase(&self, ordinal: CellId, phase: ReplicaPhase) {
        self.state.lock().pinned.insert(ordinal, phase);
    }

    /// Remove a pinned phase.
    pub fn unpin_phase(&self, ordinal: CellId) {
        self.state.lock().pinned.remove(&ordinal);
    }

    /// Make subsequent `scale_to` calls fail.
    pub fn fail_scale(&self, fail: bool) {
        self.state.lock().fail_scale = fail;
    }

    /// Desired sizes requested so far.
    pub fn scale_calls(&self) -> Vec<u32> {
        self.state.lock().scale_calls.clone()
    }

    /// `keep` arguments of prune calls so far.
    pub fn prune_calls(&self) -> Vec<u32> {
        self.state.lock().prune_calls.clone()
    }

    /// The current desired replica count.
    pub fn desired(&self) -> u32 {
        self.state.lock().desired
    }
}

#[async_trait::async_trait]
impl Orchestrator for MockOrchestrator {
    async fn scale_to(&self, replicas: u32) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.scale_calls.push(replicas);
        if state.fail_scale {
            return Err(Error::UnexpectedResponse {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                text: "injected scale failure".to_string(),
            });
        }
        state.desired = replicas;
        Ok(())
    }

    async fn replica_phase(&self, ordinal: CellId) -> Result<ReplicaPhase, Error> {
        let state = self.state.lock();
        if let Some(phase) = state.pinned.get(&ordinal) {
            return Ok(*phase);
        }
        Ok(if ordinal.get() < state.desired {
            ReplicaPhase::Running
        } else {
            ReplicaPhase::Absent
        })
    }

    async fn prune_volumes(&self, keep: u32) -> Result<(), Error> {
        self.state.lock().prune_calls.push(keep);
        Ok(())
    }
}
