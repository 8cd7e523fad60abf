//! The contract between the node runtime and the ordering engine.
//!
//! The runtime never reaches into the engine's internals: every interaction —
//! folding transactions into self-events, computing anti-entropy diffs,
//! ingesting a peer's events, advancing the ordering, signing decided blocks,
//! and the read-only inspection surface backed by the engine's store — goes
//! through [`ConsensusCore`]. The node serializes all of these calls behind a
//! single lock, so implementations may assume exclusive access for the
//! duration of each call and do not need interior synchronization.

use std::collections::BTreeMap;

use thiserror::Error;

use super::types::{
    Block, BlockSignature, Event, EventId, KnownEvents, ParticipantId, Root, RoundInfo, WireEvent,
};

/// Errors surfaced by an ordering engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An event referenced a participant that is not in the peer set.
    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    /// A requested item does not exist in the engine's store.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine's backing store failed.
    #[error("store error: {0}")]
    Store(String),

    /// Signing a block failed.
    #[error("signing error: {0}")]
    Signing(String),
}

/// The ordering engine consumed by the node runtime.
///
/// Mutating operations are `&mut self` and are only ever invoked under the
/// node's core lock. Decided blocks are delivered out of band: the engine
/// owns the sending half of the node's commit channel and publishes there
/// from [`run_consensus`](Self::run_consensus).
pub trait ConsensusCore: Send + 'static {
    /// Prepares a fresh engine. Called exactly once, before the node runs.
    fn init(&mut self) -> Result<(), CoreError>;

    /// Recomputes the engine's state from persisted events instead of
    /// starting fresh. Alternative to [`init`](Self::init).
    fn bootstrap(&mut self) -> Result<(), CoreError>;

    /// Whether this node has anything worth gossiping: pending transactions
    /// or events the ordering has not yet settled.
    fn need_gossip(&self) -> bool;

    /// Folds the pending transaction pool into a new self-event, emptying
    /// the pool. A no-op when there is nothing worth publishing.
    fn add_self_event(&mut self) -> Result<(), CoreError>;

    /// Snapshot of the anti-entropy digest: highest event index per
    /// participant as seen by this engine.
    fn known_events(&self) -> KnownEvents;

    /// The events this engine has that a peer with digest `known` lacks.
    fn event_diff(&self, known: &KnownEvents) -> Result<Vec<Event>, CoreError>;

    /// Converts events to their wire form for transmission.
    fn to_wire(&self, events: Vec<Event>) -> Result<Vec<WireEvent>, CoreError>;

    /// Ingests a peer's events into the DAG. Must be idempotent over event
    /// sets that were already applied.
    fn sync(&mut self, events: Vec<WireEvent>) -> Result<(), CoreError>;

    /// Advances the ordering over whatever the DAG now contains, publishing
    /// any newly decided blocks on the commit channel.
    fn run_consensus(&mut self) -> Result<(), CoreError>;

    /// Whether a peer with digest `known` is so far behind that a normal
    /// diff would be wasteful and catch-up semantics should apply.
    fn over_sync_limit(&self, known: &KnownEvents, limit: u64) -> bool;

    /// Appends transaction payloads to the pending pool.
    fn add_transactions(&mut self, transactions: Vec<Vec<u8>>);

    /// Signs a decided block with this validator's key.
    fn sign_block(&self, block: &Block) -> Result<BlockSignature, CoreError>;

    /// Attaches a signature so it is gossiped alongside the block.
    fn add_block_signature(&mut self, signature: BlockSignature);

    // -- Counters for the stats surface -------------------------------------

    /// Number of events the ordering has settled.
    fn consensus_events_count(&self) -> usize;

    /// Number of transactions carried by settled events.
    fn consensus_transactions_count(&self) -> usize;

    /// Index of the last decided round, if any round has been decided.
    fn last_consensus_round(&self) -> Option<i64>;

    /// Index of the last decided block, `-1` if none.
    fn last_block_index(&self) -> i64;

    /// Number of events the ordering has not yet settled.
    fn undetermined_events_count(&self) -> usize;

    /// Number of transactions waiting in the pending pool.
    fn transaction_pool_len(&self) -> usize;

    /// Number of events in the last decided round.
    fn last_round_events_count(&self) -> usize;

    // -- Store-backed inspection surface ------------------------------------

    /// The fixed participant set: address → id, in address order.
    fn participants(&self) -> BTreeMap<String, ParticipantId>;

    /// Fetches an event by id.
    fn get_event(&self, id: &str) -> Result<Event, CoreError>;

    /// Id of the most recent event authored by `participant`, if any.
    fn last_event_from(&self, participant: &str) -> Result<Option<EventId>, CoreError>;

    /// Ids of all settled events, in consensus order.
    fn consensus_events(&self) -> Vec<EventId>;

    /// Summary of a decided round.
    fn get_round(&self, index: i64) -> Result<RoundInfo, CoreError>;

    /// Index of the last decided round, `-1` if none.
    fn last_round(&self) -> i64;

    /// Witnesses of a decided round. Empty for unknown rounds.
    fn round_witnesses(&self, index: i64) -> Vec<EventId>;

    /// Number of events in a decided round. Zero for unknown rounds.
    fn round_events(&self, index: i64) -> usize;

    /// The baseline pseudo-event for a participant.
    fn get_root(&self, participant: &str) -> Result<Root, CoreError>;

    /// Fetches a decided block by index.
    fn get_block(&self, index: i64) -> Result<Block, CoreError>;

    /// Releases the engine's backing store. Called once, at the very end of
    /// node shutdown, after all concurrent work has drained.
    fn close(&mut self);
}
