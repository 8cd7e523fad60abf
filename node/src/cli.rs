//! # CLI Interface
//!
//! Command-line argument structure for `weft-node` using `clap` derive.
//! Every configurable value has an environment-variable fallback for
//! container deployments.

use clap::{Parser, Subcommand};

/// Weft validator node.
///
/// Runs a cluster of Weft consensus participants in one process, wired over
/// the in-memory transport — the devnet configuration. Exposes node stats
/// over HTTP and Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "weft-node",
    about = "Weft validator node",
    version,
    propagate_version = true
)]
pub struct WeftNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the weft-node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a devnet cluster of validator nodes.
    Run(RunArgs),
    /// Generate a fresh validator keypair and print it.
    Keygen,
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Number of validator nodes in the devnet cluster.
    #[arg(long, short = 'n', env = "WEFT_NODES", default_value_t = 3)]
    pub nodes: u64,

    /// Gossip heartbeat in milliseconds. The effective interval is jittered
    /// ±50% per round.
    #[arg(long, env = "WEFT_HEARTBEAT_MS", default_value_t = 1000)]
    pub heartbeat_ms: u64,

    /// Sync limit: how many events a peer may lag behind before being told
    /// to catch up instead of receiving a diff.
    #[arg(long, env = "WEFT_SYNC_LIMIT", default_value_t = 1000)]
    pub sync_limit: u64,

    /// Bind address for the HTTP status/stats API.
    #[arg(long, env = "WEFT_API_ADDR", default_value = "127.0.0.1:9741")]
    pub api_addr: String,

    /// Bind address for the Prometheus metrics endpoint.
    #[arg(long, env = "WEFT_METRICS_ADDR", default_value = "127.0.0.1:9742")]
    pub metrics_addr: String,

    /// Log verbosity level: trace, debug, info, warn, error.
    #[arg(long, env = "WEFT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, env = "WEFT_LOG_JSON")]
    pub log_json: bool,

    /// Disable outbound gossip: nodes only serve inbound traffic. Useful
    /// for poking at the RPC surface in isolation.
    #[arg(long)]
    pub no_gossip: bool,
}
