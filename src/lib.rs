pub mod api;
pub mod config;
pub mod consensus;
pub mod metrics;
pub mod raft_api;
pub mod registry;
pub mod types;

// Generated worker-facing gRPC types.
pub mod proto {
    tonic::include_proto!("worker");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("worker_descriptor");
}

pub use api::{create_router, ApiState};
pub use config::NodeConfig;
pub use consensus::{
    Consensus, ConsensusConfig, ConsensusError, NodeState, RaftConsensus, SharedRegistry,
};
pub use raft_api::create_raft_router;
pub use registry::AgentRegistry;
pub use types::*;
