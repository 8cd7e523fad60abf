//! # Weft Validator Node
//!
//! Entry point for the `weft-node` binary. Parses CLI arguments, initializes
//! logging and metrics, spins up a devnet cluster of validators wired over
//! the in-memory transport, and serves the HTTP status API.
//!
//! Three subcommands:
//!
//! - `run`     — start the devnet cluster
//! - `keygen`  — generate a validator keypair
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;

use weft_protocol::config::COMMIT_CHANNEL_CAPACITY;
use weft_protocol::consensus::{InmemCore, ParticipantId};
use weft_protocol::keys::Keypair;
use weft_protocol::net::inmem::InmemNetwork;
use weft_protocol::node::peer::Peer;
use weft_protocol::proxy::inmem::InmemAppProxy;
use weft_protocol::{Node, NodeConfig};

use api::{AppState, DevNode};
use cli::{Commands, WeftNodeCli};
use logging::LogFormat;
use metrics::ClusterMetrics;

/// How often the metrics gauges are refreshed from the nodes' stats maps.
const METRICS_REFRESH: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = WeftNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_cluster(args).await,
        Commands::Keygen => {
            keygen();
            Ok(())
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the devnet cluster and serves the API until interrupted.
async fn run_cluster(args: cli::RunArgs) -> Result<()> {
    let format = if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init_logging(&format!("weft_node={0},weft_protocol={0}", args.log_level), format);

    anyhow::ensure!(args.nodes > 0, "cluster size must be at least 1");

    tracing::info!(
        nodes = args.nodes,
        heartbeat_ms = args.heartbeat_ms,
        sync_limit = args.sync_limit,
        api_addr = %args.api_addr,
        metrics_addr = %args.metrics_addr,
        "starting weft devnet"
    );

    // --- Cluster ---
    let conf = NodeConfig::new(Duration::from_millis(args.heartbeat_ms), args.sync_limit);
    let network = InmemNetwork::new();
    let (nodes, proxies) = build_cluster(&network, args.nodes, conf);

    for node in &nodes {
        node.init(false)
            .with_context(|| format!("failed to init node {}", node.id()))?;
        node.run_async(!args.no_gossip);
    }
    tracing::info!(nodes = nodes.len(), "cluster running");

    // --- Metrics ---
    let cluster_metrics = Arc::new(ClusterMetrics::new());
    let poller_metrics = Arc::clone(&cluster_metrics);
    let poller_nodes = nodes.clone();
    let metrics_poller = tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_REFRESH);
        loop {
            interval.tick().await;
            for node in &poller_nodes {
                poller_metrics.observe(&node.id().to_string(), &node.get_stats());
            }
        }
    });

    // --- HTTP surfaces ---
    let app_state = AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        nodes: nodes.clone(),
        proxies,
    };
    let api_router = api::create_router(app_state);
    let api_listener = tokio::net::TcpListener::bind(&args.api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", args.api_addr))?;
    tracing::info!(addr = %args.api_addr, "API server listening");

    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(cluster_metrics);
    let metrics_listener = tokio::net::TcpListener::bind(&args.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", args.metrics_addr))?;
    tracing::info!(addr = %args.metrics_addr, "metrics server listening");

    // --- Serve until interrupted ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    metrics_poller.abort();
    for node in &nodes {
        node.shutdown().await;
    }
    tracing::info!("weft-node stopped");
    Ok(())
}

/// Assembles `n` nodes over one in-memory network.
fn build_cluster(
    network: &InmemNetwork,
    n: u64,
    conf: NodeConfig,
) -> (Vec<DevNode>, Vec<Arc<InmemAppProxy>>) {
    let keypairs: Vec<Keypair> = (0..n).map(|_| Keypair::generate()).collect();
    let peers: Vec<Peer> = keypairs
        .iter()
        .enumerate()
        .map(|(i, kp)| Peer::new(i as u64, format!("weft://node-{i}"), kp.public_key_hex()))
        .collect();
    let participants: BTreeMap<String, ParticipantId> =
        peers.iter().map(|p| (p.net_addr.clone(), p.id)).collect();

    let mut nodes = Vec::with_capacity(n as usize);
    let mut proxies = Vec::with_capacity(n as usize);
    for (id, keypair) in keypairs.into_iter().enumerate() {
        let id = id as u64;
        let (commit_tx, commit_rx) = mpsc::channel(COMMIT_CHANNEL_CAPACITY);
        let core = InmemCore::new(id, keypair, participants.clone(), commit_tx);
        let proxy = Arc::new(InmemAppProxy::new());
        let node = Node::new(
            conf.clone(),
            id,
            peers.clone(),
            core,
            commit_rx,
            network.transport(format!("weft://node-{id}")),
            Arc::clone(&proxy),
        );
        nodes.push(node);
        proxies.push(proxy);
    }
    (nodes, proxies)
}

/// Generates a validator keypair and prints both halves.
fn keygen() {
    let keypair = Keypair::generate();
    println!("secret key : {}", hex::encode(keypair.secret_bytes()));
    println!("public key : {}", keypair.public_key_hex());
}

/// Prints version information to stdout.
fn print_version() {
    println!("weft-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol  {}", weft_protocol::config::PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
