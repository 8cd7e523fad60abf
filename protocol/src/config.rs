//! # Protocol Configuration & Constants
//!
//! Every magic number in Weft lives here, together with the node runtime
//! configuration. Tuning knobs that matter for liveness (heartbeat, sync
//! limit) are fields on [`NodeConfig`]; values that are part of the protocol's
//! identity are constants.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire identity
// ---------------------------------------------------------------------------

/// Protocol magic bytes in the P2P wire preamble. Peers reject traffic that
/// does not start with these 4 bytes without parsing further.
pub const PROTOCOL_MAGIC: u32 = 0x57454654; // "WEFT"

/// Wire protocol version, negotiated at handshake. Bumped on breaking changes
/// to the sync message shapes.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// Crate version string, assembled at compile time.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Runtime parameters
// ---------------------------------------------------------------------------

/// Default heartbeat between gossip rounds. The control timer jitters this by
/// ±50% so a cohort of validators started together does not synchronize into
/// gossip storms.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(1000);

/// Default sync limit: the number of events a peer may lag behind before a
/// normal diff is considered wasteful and the peer is told to catch up.
pub const DEFAULT_SYNC_LIMIT: u64 = 1000;

/// Capacity of the commit channel between the ordering engine and the node's
/// dispatcher. The engine can decide a burst of blocks in one consensus pass;
/// the buffer absorbs that burst without blocking the engine.
pub const COMMIT_CHANNEL_CAPACITY: usize = 400;

/// Capacity of the inbound RPC channel owned by a transport.
pub const RPC_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the transaction submit channel owned by an app proxy.
pub const SUBMIT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Node configuration
// ---------------------------------------------------------------------------

/// Runtime configuration for a single validator node.
///
/// Logging is configured by the host process through `tracing`, not here —
/// the library only emits events.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Base interval of the gossip heartbeat. The effective interval is
    /// randomized around this value on every arm.
    pub heartbeat: Duration,

    /// Threshold for the core's over-sync-limit predicate: how far behind a
    /// peer may be before it is pushed into catch-up semantics instead of
    /// receiving a full diff.
    pub sync_limit: u64,
}

impl NodeConfig {
    /// Creates a configuration with explicit values.
    pub fn new(heartbeat: Duration, sync_limit: u64) -> Self {
        Self {
            heartbeat,
            sync_limit,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            sync_limit: DEFAULT_SYNC_LIMIT,
        }
    }
}
