//! In-process cluster tests: real consensus nodes with sled storage and the
//! HTTP peer transport, wired over loopback on ephemeral ports.

use flowmesh::consensus::{raft_node_id, MeshNode};
use flowmesh::{
    create_raft_router, Command, Consensus, ConsensusConfig, NodeState, RaftConsensus,
    RegisterWorkerPayload, SharedRegistry, WorkerStatus,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct TestNode {
    name: String,
    port: u16,
    consensus: Arc<RaftConsensus>,
    fsm: SharedRegistry,
    server: JoinHandle<()>,
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_node(name: &str, port: u16, data_dir: &Path, bootstrap: bool) -> TestNode {
    let fsm = SharedRegistry::new();
    let consensus = Arc::new(
        RaftConsensus::new(
            ConsensusConfig {
                node_id: name.to_string(),
                raft_addr: format!("127.0.0.1:{port}"),
                data_dir: data_dir.to_path_buf(),
                bootstrap,
                peers: Vec::new(),
            },
            fsm.clone(),
        )
        .await
        .unwrap(),
    );

    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await.unwrap();
    let router = create_raft_router(consensus.clone());
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    TestNode {
        name: name.to_string(),
        port,
        consensus,
        fsm,
        server,
    }
}

async fn start_cluster(dirs: &[tempfile::TempDir]) -> Vec<TestNode> {
    let names = ["n1", "n2", "n3"];
    let mut nodes = Vec::new();
    for (i, dir) in dirs.iter().enumerate() {
        let port = free_port().await;
        nodes.push(start_node(names[i], port, dir.path(), false).await);
    }

    let mut members = BTreeMap::new();
    for node in &nodes {
        members.insert(
            raft_node_id(&node.name),
            MeshNode {
                addr: format!("127.0.0.1:{}", node.port),
                hostname: node.name.clone(),
            },
        );
    }
    nodes[0].consensus.initialize_with(members).await.unwrap();
    nodes
}

async fn wait_for_state(node: &RaftConsensus, want: NodeState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if node.state() == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn wait_for_leader(nodes: &[TestNode], timeout: Duration) -> Option<usize> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        for (i, node) in nodes.iter().enumerate() {
            if node.consensus.state() == NodeState::Leader {
                return Some(i);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}

fn repl_worker_cmd(id: &str) -> Command {
    Command::register_worker(&RegisterWorkerPayload {
        id: id.to_string(),
        address: "10.10.0.20:8081".to_string(),
        cloud_tag: "aws".to_string(),
    })
    .unwrap()
}

async fn shutdown_cluster(nodes: Vec<TestNode>) {
    for node in nodes {
        node.server.abort();
        let _ = node.consensus.shutdown().await;
    }
}

#[tokio::test]
async fn single_node_bootstrap_elects_leader() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let node = start_node("solo", port, dir.path(), true).await;

    assert!(
        wait_for_state(&node.consensus, NodeState::Leader, Duration::from_secs(10)).await,
        "single bootstrapped node must elect itself leader within 10s"
    );
    assert_eq!(node.consensus.leader_id(), "solo");

    node.server.abort();
    node.consensus.shutdown().await.unwrap();
    assert_eq!(node.consensus.state(), NodeState::Shutdown);
}

#[tokio::test]
async fn three_node_cluster_elects_exactly_one_leader() {
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let nodes = start_cluster(&dirs).await;

    let leader =
        wait_for_leader(&nodes, Duration::from_secs(15)).await.expect("a leader within 15s");

    // Let the remaining candidates settle into followers.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut leaders = 0;
    let mut followers = 0;
    for node in &nodes {
        match node.consensus.state() {
            NodeState::Leader => leaders += 1,
            NodeState::Follower => followers += 1,
            other => panic!("unexpected state {other}"),
        }
    }
    assert_eq!(leaders, 1);
    assert_eq!(followers, 2);
    assert_eq!(nodes[leader].consensus.leader_id(), nodes[leader].name);

    shutdown_cluster(nodes).await;
}

#[tokio::test]
async fn committed_commands_replicate_to_all_fsms() {
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let nodes = start_cluster(&dirs).await;
    let leader =
        wait_for_leader(&nodes, Duration::from_secs(15)).await.expect("a leader within 15s");

    nodes[leader]
        .consensus
        .apply(repl_worker_cmd("repl-worker"), Duration::from_secs(2))
        .await
        .unwrap();

    // All three FSMs must reflect the entry within the replication window.
    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        if nodes.iter().all(|n| n.fsm.get_worker("repl-worker").is_some()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for node in &nodes {
        let worker = node
            .fsm
            .get_worker("repl-worker")
            .unwrap_or_else(|| panic!("{}: repl-worker not replicated within 500ms", node.name));
        assert_eq!(worker.status, WorkerStatus::Online);
        assert_eq!(worker.cloud_tag, "aws");
    }

    shutdown_cluster(nodes).await;
}

#[tokio::test]
async fn quorum_survives_one_stopped_replica_which_catches_up() {
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let mut nodes = start_cluster(&dirs).await;
    let leader =
        wait_for_leader(&nodes, Duration::from_secs(15)).await.expect("a leader within 15s");

    // Take one follower out of the cluster.
    let stopped_idx = (leader + 1) % 3;
    let stopped = nodes.remove(stopped_idx);
    let (stopped_name, stopped_port) = (stopped.name.clone(), stopped.port);
    let stopped_fsm = stopped.fsm.clone();
    stopped.server.abort();
    stopped.consensus.shutdown().await.unwrap();
    drop(stopped);
    // Give sled a moment to release the data-dir lock.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The remaining majority must still commit.
    let leader_node = nodes
        .iter()
        .find(|n| n.consensus.state() == NodeState::Leader)
        .expect("leader survives losing one follower");
    leader_node
        .consensus
        .apply(repl_worker_cmd("quorum-worker"), Duration::from_secs(3))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        if nodes.iter().all(|n| n.fsm.get_worker("quorum-worker").is_some()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for node in &nodes {
        assert!(
            node.fsm.get_worker("quorum-worker").is_some(),
            "{}: connected replica missing entry after majority commit",
            node.name
        );
    }
    assert!(
        stopped_fsm.get_worker("quorum-worker").is_none(),
        "stopped replica must not have the entry"
    );

    // Bring the replica back with its old data dir; it must catch up.
    let restarted = start_node(
        &stopped_name,
        stopped_port,
        dirs[stopped_idx].path(),
        false,
    )
    .await;

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut caught_up = false;
    while Instant::now() < deadline {
        if restarted.fsm.get_worker("quorum-worker").is_some() {
            caught_up = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(caught_up, "restarted replica failed to catch up within 5s");

    restarted.server.abort();
    let _ = restarted.consensus.shutdown().await;
    shutdown_cluster(nodes).await;
}
