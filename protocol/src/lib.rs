//! # Weft Protocol — Node Runtime
//!
//! Weft is a gossip-based consensus participant: each validator grows a DAG
//! of events by exchanging what it knows with randomly chosen peers, and an
//! ordering engine turns the settled part of that DAG into blocks. This
//! crate is the **runtime** around that engine, the part that has to stay
//! correct under concurrency and adversarial timing:
//!
//! - **node**: the validator lifecycle state machine, the gossip driver
//!   (pull-then-push rounds with sync-limit backpressure), the RPC handlers,
//!   the randomized heartbeat timer, and the block commit pipeline.
//! - **consensus**: the contract the runtime drives ([`ConsensusCore`]) plus
//!   the event/block data model and an in-memory core for devnets and tests.
//! - **net**: the transport contract, the wire messages, and an in-memory
//!   transport that routes RPCs between nodes in a single process.
//! - **proxy**: the application-side contract for transaction intake and
//!   block commitment with a state-hash reply.
//! - **keys**: Ed25519 signing identity for validators.
//! - **config**: protocol constants and the node configuration.
//!
//! The ordering engine itself is deliberately behind a trait: the runtime
//! only assumes the operations [`ConsensusCore`] exposes, and every mutation
//! of the core happens under a single lock owned by the node.
//!
//! [`ConsensusCore`]: consensus::ConsensusCore

pub mod config;
pub mod consensus;
pub mod keys;
pub mod net;
pub mod node;
pub mod proxy;

pub use config::NodeConfig;
pub use node::Node;
