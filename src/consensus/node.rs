use crate::consensus::network::MeshNetworkFactory;
use crate::consensus::state_machine::SharedRegistry;
use crate::consensus::storage::{create_storage, MeshNode, NodeId, TypeConfig};
use crate::consensus::{Consensus, ConsensusError, NodeState};
use crate::metrics;
use crate::types::Command;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use openraft::error::{ClientWriteError, InitializeError};
use openraft::{Config, Raft, ServerState, SnapshotPolicy};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub type MeshRaft = Raft<TypeConfig>;

/// Configuration for one consensus replica.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Stable server id; equals the DNS-resolvable hostname of this replica.
    pub node_id: String,
    /// `host:port` advertised to peers. The transport itself binds the port
    /// on all interfaces.
    pub raft_addr: String,
    /// Directory for the log database and snapshots. Must survive restarts.
    pub data_dir: PathBuf,
    /// Bootstrap a new cluster from `peers` when no prior state exists.
    pub bootstrap: bool,
    /// `host:port` of every voting member including self. Empty with
    /// `bootstrap` means a single-node cluster.
    pub peers: Vec<String>,
}

/// Derives the numeric Raft node id from a server hostname. FNV-1a so the
/// mapping is stable across builds; node ids must survive restarts and
/// upgrades.
pub fn raft_node_id(hostname: &str) -> NodeId {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in hostname.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

/// Builds the initial voter set. Each peer's server id is the host part of
/// its `host:port` entry; an empty peer list yields a single-node cluster
/// with the local advertise address.
pub fn peers_to_members(
    peers: &[String],
    node_id: &str,
    advertise_addr: &str,
) -> BTreeMap<NodeId, MeshNode> {
    let mut members = BTreeMap::new();
    if peers.is_empty() {
        members.insert(
            raft_node_id(node_id),
            MeshNode {
                addr: advertise_addr.to_string(),
                hostname: node_id.to_string(),
            },
        );
        return members;
    }
    for peer in peers {
        let hostname = peer
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(peer.as_str());
        members.insert(
            raft_node_id(hostname),
            MeshNode {
                addr: peer.clone(),
                hostname: hostname.to_string(),
            },
        );
    }
    members
}

/// Owns the Raft instance, its sled-backed log/stable store and snapshot
/// store. The rest of the system only sees the [`Consensus`] capability.
pub struct RaftConsensus {
    node_id: String,
    raft_id: NodeId,
    raft: MeshRaft,
    state: SharedRegistry,
    stopped: AtomicBool,
}

impl RaftConsensus {
    pub async fn new(cfg: ConsensusConfig, state: SharedRegistry) -> Result<Self> {
        std::fs::create_dir_all(&cfg.data_dir)
            .with_context(|| format!("create data dir {:?}", cfg.data_dir))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&cfg.data_dir, std::fs::Permissions::from_mode(0o750))
                .with_context(|| format!("set permissions on {:?}", cfg.data_dir))?;
        }

        let config = Config {
            heartbeat_interval: 500,
            election_timeout_min: 1000,
            election_timeout_max: 2000,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(100),
            ..Default::default()
        };
        let config = Arc::new(config.validate()?);

        let (log_store, sm_store) = create_storage(&cfg.data_dir, state.clone())?;
        let network = MeshNetworkFactory::new();

        let raft_id = raft_node_id(&cfg.node_id);
        let raft = Raft::new(raft_id, config, network, log_store, sm_store).await?;

        info!(
            node_id = %cfg.node_id,
            raft_id,
            raft_addr = %cfg.raft_addr,
            data_dir = ?cfg.data_dir,
            "raft node initialized"
        );

        let node = Self {
            node_id: cfg.node_id.clone(),
            raft_id,
            raft,
            state,
            stopped: AtomicBool::new(false),
        };

        if cfg.bootstrap {
            let members = peers_to_members(&cfg.peers, &cfg.node_id, &cfg.raft_addr);
            node.initialize_with(members).await?;
        }

        Ok(node)
    }

    /// Bootstraps the cluster with an explicit voter set. A no-op when the
    /// node already has persisted state.
    pub async fn initialize_with(&self, members: BTreeMap<NodeId, MeshNode>) -> Result<()> {
        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(node_id = %self.node_id, "cluster bootstrapped");
                Ok(())
            }
            Err(e) => match e.api_error() {
                Some(InitializeError::NotAllowed(_)) => {
                    debug!(node_id = %self.node_id, "existing raft state found, skipping bootstrap");
                    Ok(())
                }
                _ => Err(anyhow!("raft initialize: {e}")),
            },
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn raft(&self) -> &MeshRaft {
        &self.raft
    }

    pub fn shared_state(&self) -> &SharedRegistry {
        &self.state
    }

    pub fn term(&self) -> u64 {
        self.raft.metrics().borrow().current_term
    }

    /// Raw key/value view of the node for the observation surface.
    pub fn stats(&self) -> BTreeMap<String, String> {
        let m = self.raft.metrics().borrow().clone();
        let mut stats = BTreeMap::new();
        stats.insert("raft_id".into(), self.raft_id.to_string());
        stats.insert("state".into(), self.state_of(&m.state).to_string());
        stats.insert("term".into(), m.current_term.to_string());
        stats.insert(
            "last_log_index".into(),
            m.last_log_index.unwrap_or(0).to_string(),
        );
        stats.insert(
            "last_applied".into(),
            m.last_applied.map(|l| l.index).unwrap_or(0).to_string(),
        );
        stats.insert("leader".into(), self.leader());
        stats.insert("leader_id".into(), self.leader_id());
        stats
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.raft
            .shutdown()
            .await
            .map_err(|e| anyhow!("raft shutdown: {e}"))
    }

    fn state_of(&self, server_state: &ServerState) -> NodeState {
        if self.stopped.load(Ordering::SeqCst) {
            return NodeState::Shutdown;
        }
        match server_state {
            ServerState::Leader => NodeState::Leader,
            ServerState::Candidate => NodeState::Candidate,
            _ => NodeState::Follower,
        }
    }

    fn leader_node(&self) -> Option<MeshNode> {
        let m = self.raft.metrics().borrow().clone();
        let leader = m.current_leader?;
        m.membership_config.membership().get_node(&leader).cloned()
    }
}

#[async_trait]
impl Consensus for RaftConsensus {
    async fn apply(&self, command: Command, timeout: Duration) -> Result<(), ConsensusError> {
        let started = Instant::now();
        let write = tokio::time::timeout(timeout, self.raft.client_write(command)).await;
        match write {
            Err(_) => Err(ConsensusError::Timeout(timeout)),
            Ok(Err(e)) => match e.api_error() {
                Some(ClientWriteError::ForwardToLeader(_)) => Err(ConsensusError::NotLeader),
                _ => Err(ConsensusError::Raft(e.to_string())),
            },
            Ok(Ok(resp)) => {
                metrics::RAFT_REPLICATION_LATENCY_MS
                    .observe(started.elapsed().as_secs_f64() * 1000.0);
                match resp.data.error {
                    Some(msg) => Err(ConsensusError::Apply(msg)),
                    None => Ok(()),
                }
            }
        }
    }

    fn state(&self) -> NodeState {
        let m = self.raft.metrics().borrow().clone();
        self.state_of(&m.state)
    }

    fn leader(&self) -> String {
        self.leader_node().map(|n| n.addr).unwrap_or_default()
    }

    fn leader_id(&self) -> String {
        self.leader_node().map(|n| n.hostname).unwrap_or_default()
    }
}
