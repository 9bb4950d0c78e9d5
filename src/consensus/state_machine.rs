use crate::types::*;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// The replicated worker registry. Mutated only by committed log entries,
/// so two replicas at the same log index hold identical worker sets.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryState {
    pub workers: HashMap<String, WorkerInfo>,
    #[serde(default)]
    pub last_applied_index: u64,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed command. Decode failures and unknown ids are
    /// reported through the returned `CommandResult`; the log index advances
    /// either way, so a malformed entry can never wedge the cluster.
    pub fn apply(&mut self, command: &Command, index: u64) -> CommandResult {
        match command.kind {
            CommandType::RegisterWorker => self.apply_register_worker(&command.payload, index),
            CommandType::UpdateWorkerStatus => {
                self.apply_update_worker_status(&command.payload, index)
            }
            CommandType::Unknown => {
                warn!(index, "apply: unknown command type");
                CommandResult::err("unknown command type")
            }
        }
    }

    fn apply_register_worker(&mut self, payload: &serde_json::Value, index: u64) -> CommandResult {
        let p: RegisterWorkerPayload = match serde_json::from_value(payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                warn!(index, error = %e, "apply: decode register_worker");
                return CommandResult::err(format!("decode register_worker: {e}"));
            }
        };
        info!(worker_id = %p.id, cloud = %p.cloud_tag, index, "worker registered");
        self.workers.insert(
            p.id.clone(),
            WorkerInfo {
                id: p.id,
                address: p.address,
                cloud_tag: p.cloud_tag,
                status: WorkerStatus::Online,
                last_seen: Utc::now(),
            },
        );
        CommandResult::ok()
    }

    fn apply_update_worker_status(
        &mut self,
        payload: &serde_json::Value,
        index: u64,
    ) -> CommandResult {
        let p: UpdateWorkerStatusPayload = match serde_json::from_value(payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                warn!(index, error = %e, "apply: decode update_worker_status");
                return CommandResult::err(format!("decode update_worker_status: {e}"));
            }
        };
        let Some(worker) = self.workers.get_mut(&p.id) else {
            return CommandResult::err(format!("worker {:?} not found", p.id));
        };
        worker.status = p.status;
        worker.last_seen = Utc::now();
        info!(worker_id = %p.id, status = %p.status, index, "worker status updated");
        CommandResult::ok()
    }
}

/// Shared handle to the registry state. Writers (the consensus apply path)
/// are already serialized by log order; the lock only isolates concurrent
/// readers from structural mutation.
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryState::new())),
        }
    }

    pub fn apply(&self, command: &Command, index: u64) -> CommandResult {
        let mut state = self.inner.write().unwrap();
        state.last_applied_index = index;
        state.apply(command, index)
    }

    /// Point-in-time copy of the full state. Callers serialize outside the
    /// lock so snapshotting never stalls the apply path for long.
    pub fn snapshot(&self) -> RegistryState {
        self.inner.read().unwrap().clone()
    }

    /// The worker map alone, in the snapshot wire format.
    pub fn snapshot_workers(&self) -> HashMap<String, WorkerInfo> {
        self.inner.read().unwrap().workers.clone()
    }

    pub fn restore(&self, state: RegistryState) {
        *self.inner.write().unwrap() = state;
    }

    /// Replaces all state from a decoded snapshot.
    pub fn restore_workers(&self, workers: HashMap<String, WorkerInfo>, last_applied_index: u64) {
        let mut state = self.inner.write().unwrap();
        state.workers = workers;
        state.last_applied_index = last_applied_index;
    }

    /// All workers, deep-copied; callers may mutate freely.
    pub fn workers(&self) -> HashMap<String, WorkerInfo> {
        self.inner.read().unwrap().workers.clone()
    }

    /// A single worker by id, deep-copied.
    pub fn get_worker(&self, id: &str) -> Option<WorkerInfo> {
        self.inner.read().unwrap().workers.get(id).cloned()
    }

    pub fn last_applied(&self) -> u64 {
        self.inner.read().unwrap().last_applied_index
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new()
    }
}
