use std::env;
use std::path::PathBuf;

/// Process configuration, sourced from the environment. Unrecognized keys
/// are ignored.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub grpc_addr: String,
    pub http_addr: String,
    pub raft_addr: String,
    pub raft_data_dir: PathBuf,
    pub raft_bootstrap: bool,
    pub raft_peers: Vec<String>,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        Self {
            node_id: env_or("NODE_ID", &default_node_id()),
            grpc_addr: env_or("GRPC_ADDR", ":50051"),
            http_addr: env_or("HTTP_ADDR", ":8080"),
            raft_addr: env_or("RAFT_ADDR", ":7000"),
            raft_data_dir: PathBuf::from(env_or("RAFT_DATA_DIR", "/data/raft")),
            raft_bootstrap: bool_env("RAFT_BOOTSTRAP"),
            raft_peers: split_csv(&env::var("RAFT_PEERS").unwrap_or_default()),
        }
    }

    /// Port the gRPC server listens on, used for leader redirects.
    pub fn grpc_port(&self) -> String {
        port_of(&self.grpc_addr).unwrap_or_else(|| "50051".to_string())
    }

    pub fn grpc_listen_addr(&self) -> String {
        listen_addr(&self.grpc_addr)
    }

    pub fn http_listen_addr(&self) -> String {
        listen_addr(&self.http_addr)
    }

    /// The raft transport binds its port on all interfaces so every overlay
    /// network can reach it; `raft_addr` itself is what gets advertised.
    pub fn raft_listen_addr(&self) -> anyhow::Result<String> {
        let port = port_of(&self.raft_addr)
            .ok_or_else(|| anyhow::anyhow!("raft addr {:?} has no port", self.raft_addr))?;
        Ok(format!("0.0.0.0:{port}"))
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// True only when the variable is exactly `"true"`.
fn bool_env(key: &str) -> bool {
    env::var(key).as_deref() == Ok("true")
}

/// Plain comma split, no trimming; an empty value yields an empty list.
/// Peer entries are passed through verbatim.
pub fn split_csv(s: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(',').map(str::to_string).collect()
}

fn default_node_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "cp-unknown".to_string())
}

fn port_of(addr: &str) -> Option<String> {
    addr.rsplit_once(':')
        .map(|(_, port)| port.to_string())
        .filter(|port| !port.is_empty())
}

/// Expands Go-style `":8080"` listen addresses to all interfaces.
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
