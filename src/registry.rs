use crate::consensus::{Consensus, NodeState};
use crate::proto::worker_service_server::WorkerService;
use crate::proto::{
    HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest, RegisterWorkerResponse,
};
use crate::types::{Command, RegisterWorkerPayload, UpdateWorkerStatusPayload, WorkerStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A worker is considered stale after three missed 5 s beats.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
pub const RAFT_APPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Ephemeral liveness record for one worker. Lives only in memory on the
/// current leader; the authoritative worker status is the replicated
/// registry state.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    pub last_seen: DateTime<Utc>,
    /// Prevents duplicate offline submissions for the same outage.
    pub marked_offline: bool,
}

/// Terminates the worker-facing gRPC service. Enforces leader-only writes,
/// redirects followers, and runs the background monitor that promotes
/// missed heartbeats into replicated offline commands.
pub struct AgentRegistry {
    trackers: Mutex<HashMap<String, HeartbeatTracker>>,
    raft: Arc<dyn Consensus>,
    /// Port the gRPC server listens on, used to build redirect addresses
    /// from the leader's raft address.
    grpc_port: String,
}

impl AgentRegistry {
    pub fn new(raft: Arc<dyn Consensus>, grpc_port: String) -> Self {
        Self {
            trackers: Mutex::new(HashMap::new()),
            raft,
            grpc_port,
        }
    }

    /// Launches the heartbeat monitor. Stops when `shutdown_rx` flips.
    pub fn spawn_monitor(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_heartbeats().await;
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
        })
    }

    /// One monitor tick: mark stale workers offline through consensus.
    /// A worker already marked is skipped until a heartbeat or
    /// re-registration clears the flag.
    pub async fn check_heartbeats(&self) {
        if self.raft.state() != NodeState::Leader {
            return;
        }

        let cutoff = Utc::now() - ChronoDuration::seconds(HEARTBEAT_TIMEOUT.as_secs() as i64);

        // Flip marked_offline inside the lock so concurrent ticks cannot
        // queue the same worker twice.
        let stale: Vec<String> = {
            let mut trackers = self.trackers.lock().unwrap();
            trackers
                .iter_mut()
                .filter(|(_, t)| !t.marked_offline && t.last_seen < cutoff)
                .map(|(id, t)| {
                    t.marked_offline = true;
                    id.clone()
                })
                .collect()
        };

        // Apply outside the lock: a slow commit must not stall heartbeats.
        for id in stale {
            warn!(worker_id = %id, "worker heartbeat timeout, marking offline");
            let cmd = match Command::update_worker_status(&UpdateWorkerStatusPayload {
                id: id.clone(),
                status: WorkerStatus::Offline,
            }) {
                Ok(cmd) => cmd,
                Err(e) => {
                    error!(worker_id = %id, error = %e, "encode offline command");
                    continue;
                }
            };
            if let Err(e) = self.raft.apply(cmd, RAFT_APPLY_TIMEOUT).await {
                // Leave marked_offline set so a struggling cluster is not
                // stormed with retries; the worker's next heartbeat or
                // re-registration resets the flag.
                error!(worker_id = %id, error = %e, "raft apply offline");
            }
        }
    }

    /// Converts a raft peer address (e.g. `cp-aws-1:7000`) into the matching
    /// gRPC address (`cp-aws-1:50051`).
    ///
    /// When the raft transport resolved the peer hostname to an IP, that IP
    /// may only be routable inside one overlay network, so the leader's
    /// stable server id is substituted as the host.
    fn raft_addr_to_grpc(&self, raft_addr: &str) -> String {
        if raft_addr.is_empty() {
            return String::new();
        }
        let Some((host, _)) = raft_addr.rsplit_once(':') else {
            warn!(addr = %raft_addr, "cannot parse raft addr");
            return String::new();
        };
        let host = if host.parse::<IpAddr>().is_ok() {
            let id = self.raft.leader_id();
            if id.is_empty() {
                return String::new();
            }
            id
        } else {
            host.to_string()
        };
        format!("{host}:{}", self.grpc_port)
    }

    fn leader_redirect(&self) -> String {
        self.raft_addr_to_grpc(&self.raft.leader())
    }
}

#[tonic::async_trait]
impl WorkerService for AgentRegistry {
    async fn register_worker(
        &self,
        request: tonic::Request<RegisterWorkerRequest>,
    ) -> Result<tonic::Response<RegisterWorkerResponse>, tonic::Status> {
        let req = request.into_inner();

        if self.raft.state() != NodeState::Leader {
            let leader_grpc = self.leader_redirect();
            info!(
                worker_id = %req.worker_id,
                leader_grpc = %leader_grpc,
                "RegisterWorker: not leader, redirecting"
            );
            return Ok(tonic::Response::new(RegisterWorkerResponse {
                ok: false,
                leader_addr: leader_grpc,
            }));
        }

        let cmd = Command::register_worker(&RegisterWorkerPayload {
            id: req.worker_id.clone(),
            address: req.address.clone(),
            cloud_tag: req.cloud_tag.clone(),
        })
        .map_err(|e| tonic::Status::internal(format!("encode command: {e}")))?;

        // Detach the write from the RPC context: once accepted it runs its
        // full commit timeout even if the worker hangs up mid-call.
        let raft = self.raft.clone();
        tokio::spawn(async move { raft.apply(cmd, RAFT_APPLY_TIMEOUT).await })
            .await
            .map_err(|e| tonic::Status::internal(format!("apply task: {e}")))?
            .map_err(|e| tonic::Status::internal(format!("raft apply: {e}")))?;

        {
            let mut trackers = self.trackers.lock().unwrap();
            trackers.insert(
                req.worker_id.clone(),
                HeartbeatTracker {
                    last_seen: Utc::now(),
                    marked_offline: false,
                },
            );
        }

        info!(
            worker_id = %req.worker_id,
            cloud = %req.cloud_tag,
            address = %req.address,
            "worker registered"
        );
        Ok(tonic::Response::new(RegisterWorkerResponse {
            ok: true,
            leader_addr: String::new(),
        }))
    }

    async fn heartbeat(
        &self,
        request: tonic::Request<HeartbeatRequest>,
    ) -> Result<tonic::Response<HeartbeatResponse>, tonic::Status> {
        let req = request.into_inner();

        if self.raft.state() != NodeState::Leader {
            return Ok(tonic::Response::new(HeartbeatResponse {
                ok: false,
                leader_addr: self.leader_redirect(),
            }));
        }

        {
            let mut trackers = self.trackers.lock().unwrap();
            // A worker heartbeating without a tracker registered on this
            // leader is normal after a failover; allocate one so the monitor
            // does not flag it as stale.
            let tracker = trackers.entry(req.worker_id.clone()).or_insert_with(|| {
                HeartbeatTracker {
                    last_seen: Utc::now(),
                    marked_offline: false,
                }
            });
            tracker.last_seen = Utc::now();
            tracker.marked_offline = false;
        }

        debug!(worker_id = %req.worker_id, "heartbeat received");
        Ok(tonic::Response::new(HeartbeatResponse {
            ok: true,
            leader_addr: String::new(),
        }))
    }
}
