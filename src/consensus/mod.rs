mod network;
mod node;
mod state_machine;
mod storage;

pub use network::*;
pub use node::*;
pub use state_machine::*;
pub use storage::*;

use crate::types::Command;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Role of this replica, mirroring the Raft server states plus a terminal
/// `Shutdown` after the node has been stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl NodeState {
    /// Gauge encoding: 0=Follower, 1=Candidate, 2=Leader, 3=Shutdown.
    pub fn as_metric(&self) -> f64 {
        match self {
            NodeState::Follower => 0.0,
            NodeState::Candidate => 1.0,
            NodeState::Leader => 2.0,
            NodeState::Shutdown => 3.0,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
            NodeState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("not the leader")]
    NotLeader,

    #[error("commit timed out after {0:?}")]
    Timeout(Duration),

    #[error("command rejected by state machine: {0}")]
    Apply(String),

    #[error("raft error: {0}")]
    Raft(String),
}

/// The narrow capability the agent registry needs from the consensus node.
/// Keeping it this small lets registry tests run against a mock instead of
/// a live cluster.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Submits a command and waits for quorum commit, at most `timeout`.
    async fn apply(&self, command: Command, timeout: Duration) -> Result<(), ConsensusError>;

    fn state(&self) -> NodeState;

    /// Advertised transport address of the current leader, or empty when
    /// unknown. May be an IP if the transport resolved the hostname.
    fn leader(&self) -> String;

    /// Stable server id (hostname) of the current leader, or empty.
    fn leader_id(&self) -> String;
}
