use anyhow::{Context, Result};
use flowmesh::proto::worker_service_server::WorkerServiceServer;
use flowmesh::{
    create_raft_router, create_router, metrics, AgentRegistry, ApiState, Consensus,
    ConsensusConfig, NodeConfig, RaftConsensus, SharedRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowmesh=info,openraft=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    metrics::init();

    let config = NodeConfig::from_env();
    info!(
        node_id = %config.node_id,
        grpc_addr = %config.grpc_addr,
        http_addr = %config.http_addr,
        raft_addr = %config.raft_addr,
        raft_data_dir = ?config.raft_data_dir,
        raft_bootstrap = config.raft_bootstrap,
        raft_peers = ?config.raft_peers,
        "control plane starting"
    );

    // Consensus node and the replicated registry it drives.
    let registry_state = SharedRegistry::new();
    let consensus = Arc::new(
        RaftConsensus::new(
            ConsensusConfig {
                node_id: config.node_id.clone(),
                raft_addr: config.raft_addr.clone(),
                data_dir: config.raft_data_dir.clone(),
                bootstrap: config.raft_bootstrap,
                peers: config.raft_peers.clone(),
            },
            registry_state.clone(),
        )
        .await
        .context("start consensus node")?,
    );

    // Raft peer transport: bind the port on all interfaces, advertise
    // whatever RAFT_ADDR says.
    let raft_listener = TcpListener::bind(config.raft_listen_addr()?)
        .await
        .context("bind raft addr")?;
    info!(addr = %raft_listener.local_addr()?, "raft transport listening");
    let raft_router = create_raft_router(consensus.clone());
    let raft_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(raft_listener, raft_router).await {
            error!(error = %e, "raft transport server error");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Agent registry: worker RPCs plus the heartbeat monitor.
    let agents = Arc::new(AgentRegistry::new(
        consensus.clone() as Arc<dyn Consensus>,
        config.grpc_port(),
    ));
    let monitor = agents.clone().spawn_monitor(shutdown_rx.clone());

    let poller = spawn_metrics_poller(consensus.clone(), shutdown_rx.clone());

    // Worker-facing gRPC endpoint: service + health + reflection.
    let grpc_addr: SocketAddr = config
        .grpc_listen_addr()
        .parse()
        .context("parse grpc addr")?;
    let grpc_listener = TcpListener::bind(grpc_addr)
        .await
        .context("bind grpc addr")?;
    info!(addr = %grpc_addr, "gRPC server listening");

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;
    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(flowmesh::proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("build reflection service")?;

    let mut grpc_shutdown = shutdown_rx.clone();
    let grpc_server = tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(health_service)
            .add_service(reflection_service)
            .add_service(WorkerServiceServer::from_arc(agents.clone()))
            .serve_with_incoming_shutdown(TcpListenerStream::new(grpc_listener), async move {
                let _ = grpc_shutdown.changed().await;
            }),
    );

    // Observation HTTP surface.
    let http_listener = TcpListener::bind(config.http_listen_addr())
        .await
        .context("bind http addr")?;
    info!(addr = %http_listener.local_addr()?, "HTTP server listening");
    let api_router = create_router(ApiState {
        node_id: config.node_id.clone(),
        consensus: consensus.clone(),
        registry: registry_state.clone(),
    });
    let http_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, api_router).await {
            error!(error = %e, "http server error");
        }
    });

    wait_for_signal().await;
    info!("shutting down");

    // Ordering: stop RPC intake and the monitor, drain gRPC, then stop
    // consensus so the stable store flushes, and finally the debug surface.
    let _ = shutdown_tx.send(true);
    let _ = monitor.await;
    let _ = poller.await;
    match grpc_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "gRPC server error"),
        Err(e) => error!(error = %e, "gRPC server task error"),
    }
    if let Err(e) = consensus.shutdown().await {
        error!(error = %e, "raft shutdown error");
    }
    raft_server.abort();
    http_server.abort();
    info!("shutdown complete");

    Ok(())
}

/// Polls consensus every 5 s and keeps the Prometheus gauges current. An
/// election is counted whenever the term rises from a positive value.
fn spawn_metrics_poller(
    consensus: Arc<RaftConsensus>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        let mut last_term = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    metrics::RAFT_STATE.set(consensus.state().as_metric());
                    last_term = metrics::observe_term(last_term, consensus.term());
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
