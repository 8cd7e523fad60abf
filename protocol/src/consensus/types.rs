//! Event and block data model shared between the runtime, the wire format,
//! and the ordering engine.
//!
//! The runtime treats most of these as opaque payload: it moves them between
//! the transport, the core, and the application without interpreting them.
//! The two exceptions are spelled out by the gossip protocol itself — the
//! known-events vector (the anti-entropy digest exchanged in every sync) and
//! the block body's state-hash field (written during commit).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::keys::Signature;

/// A participant's integer id, unique within the peer set.
pub type ParticipantId = u64;

/// Index of an event in its creator's own sequence. `-1` means "none known",
/// which is why this is signed.
pub type EventIndex = i64;

/// Content-addressed event identifier (hex digest).
pub type EventId = String;

/// The anti-entropy digest: for each participant, the highest event index
/// that participant has delivered to us.
pub type KnownEvents = HashMap<ParticipantId, EventIndex>;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A node of the gossip DAG: authored by one participant, carrying zero or
/// more opaque transaction payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Id of the participant that authored the event.
    pub creator: ParticipantId,
    /// Position in the creator's own event sequence, starting at 0.
    pub index: EventIndex,
    /// Opaque transaction payloads folded into this event.
    pub transactions: Vec<Vec<u8>>,
}

impl Event {
    /// Creates an event with the given payload batch.
    pub fn new(creator: ParticipantId, index: EventIndex, transactions: Vec<Vec<u8>>) -> Self {
        Self {
            creator,
            index,
            transactions,
        }
    }

    /// Content digest of the event, used as its identifier.
    pub fn id(&self) -> EventId {
        let mut hasher = Sha256::new();
        hasher.update(self.creator.to_be_bytes());
        hasher.update(self.index.to_be_bytes());
        for tx in &self.transactions {
            hasher.update((tx.len() as u64).to_be_bytes());
            hasher.update(tx);
        }
        hex::encode(hasher.finalize())
    }

    /// Converts to the serialization form used on the wire.
    pub fn to_wire(&self) -> WireEvent {
        WireEvent {
            creator: self.creator,
            index: self.index,
            transactions: self.transactions.clone(),
        }
    }

    /// Reconstructs an event from its wire form.
    pub fn from_wire(wire: WireEvent) -> Self {
        Self {
            creator: wire.creator,
            index: wire.index,
            transactions: wire.transactions,
        }
    }
}

/// Wire form of an [`Event`]. Kept separate from the in-DAG representation so
/// the engine can enrich its own events without changing the sync messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub creator: ParticipantId,
    pub index: EventIndex,
    pub transactions: Vec<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// The signed-over part of a block.
///
/// `state_hash` starts empty when the engine decides the block and is filled
/// in by the commit pipeline with the application's post-execution digest —
/// the block is only signed after that mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    /// Monotonic block number, starting at 0.
    pub index: i64,
    /// Consensus round in which this block was decided.
    pub round_received: i64,
    /// Application state digest after executing this block.
    pub state_hash: Vec<u8>,
    /// Ordered transaction payloads.
    pub transactions: Vec<Vec<u8>>,
}

impl BlockBody {
    /// Digest of the body, the message that block signatures cover.
    pub fn hash(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_be_bytes());
        hasher.update(self.round_received.to_be_bytes());
        hasher.update((self.state_hash.len() as u64).to_be_bytes());
        hasher.update(&self.state_hash);
        for tx in &self.transactions {
            hasher.update((tx.len() as u64).to_be_bytes());
            hasher.update(tx);
        }
        hasher.finalize().to_vec()
    }
}

/// A totally-ordered block as emitted by the ordering engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub body: BlockBody,
    /// Validator attestations collected so far.
    pub signatures: Vec<BlockSignature>,
}

impl Block {
    /// Creates an unsigned block.
    pub fn new(index: i64, round_received: i64, transactions: Vec<Vec<u8>>) -> Self {
        Self {
            body: BlockBody {
                index,
                round_received,
                state_hash: Vec::new(),
                transactions,
            },
            signatures: Vec::new(),
        }
    }

    pub fn index(&self) -> i64 {
        self.body.index
    }

    pub fn round_received(&self) -> i64 {
        self.body.round_received
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.body.transactions
    }
}

/// One validator's attestation over a block body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    /// Id of the signing validator.
    pub validator: ParticipantId,
    /// Index of the block the signature covers.
    pub index: i64,
    /// Ed25519 signature over the block body hash.
    pub signature: Signature,
}

// ---------------------------------------------------------------------------
// Rounds and roots
// ---------------------------------------------------------------------------

/// Summary of one consensus round: the events it decided and the witnesses
/// that decided it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    pub index: i64,
    /// Every event decided in this round, in consensus order.
    pub events: Vec<EventId>,
    /// The round's witness events (first event per creator in the round).
    pub witnesses: Vec<EventId>,
}

/// A participant's baseline pseudo-event: the anchor below which the DAG is
/// not tracked for that participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub participant: ParticipantId,
    /// Index the root stands in for; `-1` for a fresh participant.
    pub index: EventIndex,
    /// Identifier of the anchor.
    pub id: EventId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_depends_on_payload() {
        let a = Event::new(1, 0, vec![b"tx1".to_vec()]);
        let b = Event::new(1, 0, vec![b"tx2".to_vec()]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn event_wire_roundtrip() {
        let event = Event::new(3, 7, vec![b"payload".to_vec(), Vec::new()]);
        assert_eq!(Event::from_wire(event.to_wire()), event);
    }

    #[test]
    fn block_body_hash_covers_state_hash() {
        let mut block = Block::new(0, 1, vec![b"tx".to_vec()]);
        let before = block.body.hash();
        block.body.state_hash = vec![0xAA; 32];
        assert_ne!(before, block.body.hash());
    }

    #[test]
    fn block_accessors() {
        let block = Block::new(4, 2, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(block.index(), 4);
        assert_eq!(block.round_received(), 2);
        assert_eq!(block.transactions().len(), 2);
        assert!(block.signatures.is_empty());
    }
}
