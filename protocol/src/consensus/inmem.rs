//! A deterministic in-process ordering engine.
//!
//! `InmemCore` exists so the runtime — the part of Weft this crate is about —
//! can be driven end to end in a single process: devnet clusters, the
//! multi-node test harness, and examples all run on it. It is **not** a BFT
//! engine: ordering is a plain deterministic sweep over the DAG with no
//! witness elections and no fault tolerance, and nothing is persisted.
//!
//! What it does honor is the contract the runtime relies on:
//!
//! - event indexes are per-creator and monotonic, and the known-events digest
//!   is the per-creator maximum;
//! - `event_diff` returns exactly the events above the peer's watermark;
//! - `sync` is idempotent over events that were already applied;
//! - `run_consensus` settles events in `(index, creator)` order and publishes
//!   one block per pass that settles at least one transaction;
//! - `over_sync_limit` compares the summed positive per-creator lag against
//!   the configured limit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::keys::Keypair;

use super::core::{ConsensusCore, CoreError};
use super::types::{
    Block, BlockSignature, Event, EventId, KnownEvents, ParticipantId, Root, RoundInfo, WireEvent,
};

/// In-memory ordering engine. See the module docs for what this is and is not.
pub struct InmemCore {
    id: ParticipantId,
    keypair: Keypair,

    /// Fixed peer set: participant address → id.
    participants: BTreeMap<String, ParticipantId>,
    /// Ids of `participants`, for membership checks during sync.
    participant_ids: HashSet<ParticipantId>,

    /// Every event in the DAG, by content id.
    events: HashMap<EventId, Event>,
    /// Per-creator event ids in index order.
    by_creator: HashMap<ParticipantId, Vec<EventId>>,
    /// Highest event index per creator.
    known: KnownEvents,

    /// Payloads waiting to be folded into the next self-event.
    transaction_pool: Vec<Vec<u8>>,

    /// Events the ordering has not yet settled, in arrival order.
    undecided: Vec<EventId>,
    /// Settled events, in consensus order.
    decided: Vec<EventId>,
    decided_tx_count: usize,

    rounds: Vec<RoundInfo>,
    blocks: Vec<Block>,

    commit_tx: mpsc::Sender<Block>,
    closes: Arc<AtomicUsize>,
}

impl InmemCore {
    /// Creates an engine for validator `id` over a fixed participant set.
    ///
    /// Decided blocks are published on `commit_tx`; the receiving half
    /// belongs to the node's dispatcher.
    pub fn new(
        id: ParticipantId,
        keypair: Keypair,
        participants: BTreeMap<String, ParticipantId>,
        commit_tx: mpsc::Sender<Block>,
    ) -> Self {
        let participant_ids: HashSet<ParticipantId> = participants.values().copied().collect();
        let known: KnownEvents = participant_ids.iter().map(|&pid| (pid, -1)).collect();
        Self {
            id,
            keypair,
            participants,
            participant_ids,
            events: HashMap::new(),
            by_creator: HashMap::new(),
            known,
            transaction_pool: Vec::new(),
            undecided: Vec::new(),
            decided: Vec::new(),
            decided_tx_count: 0,
            rounds: Vec::new(),
            blocks: Vec::new(),
            commit_tx,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared close counter, for harnesses asserting shutdown discipline.
    pub fn close_probe(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }

    fn insert_event(&mut self, event: Event) {
        let id = event.id();
        let creator = event.creator;
        let index = event.index;
        self.by_creator.entry(creator).or_default().push(id.clone());
        self.undecided.push(id.clone());
        self.events.insert(id, event);
        let watermark = self.known.entry(creator).or_insert(-1);
        if index > *watermark {
            *watermark = index;
        }
    }

    fn participant_id(&self, address: &str) -> Result<ParticipantId, CoreError> {
        self.participants
            .get(address)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("participant {address}")))
    }
}

impl ConsensusCore for InmemCore {
    fn init(&mut self) -> Result<(), CoreError> {
        debug!(id = self.id, peers = self.participants.len(), "core init");
        Ok(())
    }

    fn bootstrap(&mut self) -> Result<(), CoreError> {
        // Nothing is persisted in-memory, so bootstrap degenerates to init.
        debug!(id = self.id, "core bootstrap (no persisted events)");
        self.init()
    }

    fn need_gossip(&self) -> bool {
        !self.transaction_pool.is_empty() || !self.undecided.is_empty()
    }

    fn add_self_event(&mut self) -> Result<(), CoreError> {
        if self.transaction_pool.is_empty() && self.undecided.is_empty() {
            // Nothing worth publishing: no payload and no foreign events to
            // anchor. Creating an event here would only pollute the DAG.
            return Ok(());
        }
        let index = self.known.get(&self.id).copied().unwrap_or(-1) + 1;
        let transactions = std::mem::take(&mut self.transaction_pool);
        let event = Event::new(self.id, index, transactions);
        debug!(
            id = self.id,
            index,
            txs = event.transactions.len(),
            "new self event"
        );
        self.insert_event(event);
        Ok(())
    }

    fn known_events(&self) -> KnownEvents {
        self.known.clone()
    }

    fn event_diff(&self, known: &KnownEvents) -> Result<Vec<Event>, CoreError> {
        let mut diff: Vec<Event> = Vec::new();
        for (&creator, ids) in &self.by_creator {
            let watermark = known.get(&creator).copied().unwrap_or(-1);
            for id in ids {
                let event = self
                    .events
                    .get(id)
                    .ok_or_else(|| CoreError::Store(format!("dangling event id {id}")))?;
                if event.index > watermark {
                    diff.push(event.clone());
                }
            }
        }
        diff.sort_by_key(|e| (e.index, e.creator));
        Ok(diff)
    }

    fn to_wire(&self, events: Vec<Event>) -> Result<Vec<WireEvent>, CoreError> {
        Ok(events.iter().map(Event::to_wire).collect())
    }

    fn sync(&mut self, events: Vec<WireEvent>) -> Result<(), CoreError> {
        for wire in events {
            if !self.participant_ids.contains(&wire.creator) {
                return Err(CoreError::UnknownParticipant(wire.creator));
            }
            let watermark = self.known.get(&wire.creator).copied().unwrap_or(-1);
            if wire.index <= watermark {
                // Already applied; replays are a no-op.
                continue;
            }
            self.insert_event(Event::from_wire(wire));
        }
        Ok(())
    }

    fn run_consensus(&mut self) -> Result<(), CoreError> {
        if self.undecided.is_empty() {
            return Ok(());
        }

        // Settle everything outstanding in one pass, in (index, creator)
        // order, which every honest node computes identically.
        let mut batch = std::mem::take(&mut self.undecided);
        batch.sort_by_key(|id| {
            self.events
                .get(id)
                .map(|e| (e.index, e.creator))
                .unwrap_or((i64::MAX, u64::MAX))
        });

        let round_index = self.rounds.len() as i64;
        let mut witnesses: Vec<EventId> = Vec::new();
        let mut seen_creators: HashSet<ParticipantId> = HashSet::new();
        let mut transactions: Vec<Vec<u8>> = Vec::new();

        for id in &batch {
            if let Some(event) = self.events.get(id) {
                if seen_creators.insert(event.creator) {
                    witnesses.push(id.clone());
                }
                transactions.extend(event.transactions.iter().cloned());
            }
        }

        self.decided.extend(batch.iter().cloned());
        self.decided_tx_count += transactions.len();
        self.rounds.push(RoundInfo {
            index: round_index,
            events: batch,
            witnesses,
        });

        if !transactions.is_empty() {
            let block = Block::new(self.blocks.len() as i64, round_index, transactions);
            debug!(
                id = self.id,
                block = block.index(),
                round = round_index,
                txs = block.transactions().len(),
                "block decided"
            );
            self.blocks.push(block.clone());
            match self.commit_tx.try_send(block) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(block)) => {
                    warn!(block = block.index(), "commit channel full, delivery dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("commit channel closed, block not delivered");
                }
            }
        }

        Ok(())
    }

    fn over_sync_limit(&self, known: &KnownEvents, limit: u64) -> bool {
        let mut lag: i64 = 0;
        for (&pid, &mine) in &self.known {
            let theirs = known.get(&pid).copied().unwrap_or(-1);
            if mine > theirs {
                lag += mine - theirs;
            }
        }
        lag > limit as i64
    }

    fn add_transactions(&mut self, transactions: Vec<Vec<u8>>) {
        self.transaction_pool.extend(transactions);
    }

    fn sign_block(&self, block: &Block) -> Result<BlockSignature, CoreError> {
        let signature = self.keypair.sign(&block.body.hash());
        Ok(BlockSignature {
            validator: self.id,
            index: block.index(),
            signature,
        })
    }

    fn add_block_signature(&mut self, signature: BlockSignature) {
        let index = signature.index;
        match self.blocks.get_mut(index as usize) {
            Some(block) if block.index() == index => {
                if !block
                    .signatures
                    .iter()
                    .any(|s| s.validator == signature.validator)
                {
                    block.signatures.push(signature);
                }
            }
            _ => debug!(index, "signature for unknown block, dropped"),
        }
    }

    fn consensus_events_count(&self) -> usize {
        self.decided.len()
    }

    fn consensus_transactions_count(&self) -> usize {
        self.decided_tx_count
    }

    fn last_consensus_round(&self) -> Option<i64> {
        self.rounds.last().map(|r| r.index)
    }

    fn last_block_index(&self) -> i64 {
        self.blocks.last().map(Block::index).unwrap_or(-1)
    }

    fn undetermined_events_count(&self) -> usize {
        self.undecided.len()
    }

    fn transaction_pool_len(&self) -> usize {
        self.transaction_pool.len()
    }

    fn last_round_events_count(&self) -> usize {
        self.rounds.last().map(|r| r.events.len()).unwrap_or(0)
    }

    fn participants(&self) -> BTreeMap<String, ParticipantId> {
        self.participants.clone()
    }

    fn get_event(&self, id: &str) -> Result<Event, CoreError> {
        self.events
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("event {id}")))
    }

    fn last_event_from(&self, participant: &str) -> Result<Option<EventId>, CoreError> {
        let pid = self.participant_id(participant)?;
        Ok(self.by_creator.get(&pid).and_then(|ids| ids.last()).cloned())
    }

    fn consensus_events(&self) -> Vec<EventId> {
        self.decided.clone()
    }

    fn get_round(&self, index: i64) -> Result<RoundInfo, CoreError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.rounds.get(i))
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("round {index}")))
    }

    fn last_round(&self) -> i64 {
        self.rounds.len() as i64 - 1
    }

    fn round_witnesses(&self, index: i64) -> Vec<EventId> {
        self.get_round(index).map(|r| r.witnesses).unwrap_or_default()
    }

    fn round_events(&self, index: i64) -> usize {
        self.get_round(index).map(|r| r.events.len()).unwrap_or(0)
    }

    fn get_root(&self, participant: &str) -> Result<Root, CoreError> {
        let pid = self.participant_id(participant)?;
        Ok(Root {
            participant: pid,
            index: -1,
            id: format!("root-{pid}"),
        })
    }

    fn get_block(&self, index: i64) -> Result<Block, CoreError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.blocks.get(i))
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("block {index}")))
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        debug!(id = self.id, "core store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::COMMIT_CHANNEL_CAPACITY;

    fn make_core(id: ParticipantId, n: u64) -> (InmemCore, mpsc::Receiver<Block>) {
        let participants: BTreeMap<String, ParticipantId> =
            (0..n).map(|i| (format!("peer-{i}"), i)).collect();
        let (commit_tx, commit_rx) = mpsc::channel(COMMIT_CHANNEL_CAPACITY);
        (
            InmemCore::new(id, Keypair::generate(), participants, commit_tx),
            commit_rx,
        )
    }

    #[test]
    fn fresh_core_has_nothing_to_gossip() {
        let (core, _rx) = make_core(0, 2);
        assert!(!core.need_gossip());
        assert_eq!(core.known_events().get(&0), Some(&-1));
        assert_eq!(core.last_block_index(), -1);
        assert_eq!(core.last_round(), -1);
        assert_eq!(core.last_consensus_round(), None);
    }

    #[test]
    fn empty_pool_self_event_is_noop() {
        let (mut core, _rx) = make_core(0, 2);
        core.add_self_event().unwrap();
        assert_eq!(core.known_events().get(&0), Some(&-1));
        assert_eq!(core.undetermined_events_count(), 0);
    }

    #[test]
    fn self_event_folds_transaction_pool() {
        let (mut core, _rx) = make_core(0, 2);
        core.add_transactions(vec![b"tx1".to_vec(), b"tx2".to_vec()]);
        assert!(core.need_gossip());
        assert_eq!(core.transaction_pool_len(), 2);

        core.add_self_event().unwrap();
        assert_eq!(core.transaction_pool_len(), 0);
        assert_eq!(core.known_events().get(&0), Some(&0));
        assert_eq!(core.undetermined_events_count(), 1);
    }

    #[test]
    fn event_diff_respects_watermarks() {
        let (mut core, _rx) = make_core(0, 2);
        core.add_transactions(vec![b"a".to_vec()]);
        core.add_self_event().unwrap();
        core.add_transactions(vec![b"b".to_vec()]);
        core.add_self_event().unwrap();

        // Peer that has seen nothing gets both events.
        let fresh: KnownEvents = [(0, -1), (1, -1)].into();
        assert_eq!(core.event_diff(&fresh).unwrap().len(), 2);

        // Peer that has our first event only gets the second.
        let caught_up: KnownEvents = [(0, 0), (1, -1)].into();
        let diff = core.event_diff(&caught_up).unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].index, 1);
    }

    #[test]
    fn sync_is_idempotent() {
        let (mut a, _arx) = make_core(0, 2);
        let (mut b, _brx) = make_core(1, 2);
        a.add_transactions(vec![b"tx".to_vec()]);
        a.add_self_event().unwrap();

        let wire = a.to_wire(a.event_diff(&b.known_events()).unwrap()).unwrap();
        b.sync(wire.clone()).unwrap();
        let known_after_first = b.known_events();
        let undecided_after_first = b.undetermined_events_count();

        b.sync(wire).unwrap();
        assert_eq!(b.known_events(), known_after_first);
        assert_eq!(b.undetermined_events_count(), undecided_after_first);
    }

    #[test]
    fn sync_rejects_unknown_creator() {
        let (mut core, _rx) = make_core(0, 2);
        let stray = WireEvent {
            creator: 99,
            index: 0,
            transactions: vec![],
        };
        assert!(matches!(
            core.sync(vec![stray]),
            Err(CoreError::UnknownParticipant(99))
        ));
    }

    #[tokio::test]
    async fn consensus_emits_block_with_transactions() {
        let (mut core, mut rx) = make_core(0, 2);
        core.add_transactions(vec![b"payload".to_vec()]);
        core.add_self_event().unwrap();
        core.run_consensus().unwrap();

        let block = rx.recv().await.unwrap();
        assert_eq!(block.index(), 0);
        assert_eq!(block.transactions(), &[b"payload".to_vec()]);
        assert_eq!(core.consensus_events_count(), 1);
        assert_eq!(core.consensus_transactions_count(), 1);
        assert_eq!(core.last_consensus_round(), Some(0));
        assert_eq!(core.last_block_index(), 0);
        assert_eq!(core.undetermined_events_count(), 0);
        assert!(!core.need_gossip());
    }

    #[tokio::test]
    async fn empty_round_produces_no_block() {
        let (mut a, _arx) = make_core(0, 2);
        let (mut b, mut brx) = make_core(1, 2);

        // An empty self-event (anchoring foreign events) settles without
        // producing a block.
        a.insert_event(Event::new(0, 0, vec![]));
        let wire = a.to_wire(a.event_diff(&b.known_events()).unwrap()).unwrap();
        b.sync(wire).unwrap();
        b.run_consensus().unwrap();

        assert_eq!(b.consensus_events_count(), 1);
        assert_eq!(b.last_block_index(), -1);
        assert!(brx.try_recv().is_err());
    }

    #[test]
    fn over_sync_limit_sums_positive_lag() {
        let (mut core, _rx) = make_core(0, 2);
        for i in 0..3 {
            core.add_transactions(vec![format!("tx{i}").into_bytes()]);
            core.add_self_event().unwrap();
        }

        let behind: KnownEvents = [(0, -1), (1, -1)].into();
        assert!(core.over_sync_limit(&behind, 1));
        assert!(!core.over_sync_limit(&behind, 10));

        // A peer that is ahead of us contributes no lag.
        let ahead: KnownEvents = [(0, 5), (1, 5)].into();
        assert!(!core.over_sync_limit(&ahead, 1));
    }

    #[test]
    fn block_signatures_attach_once() {
        let (mut core, _rx) = make_core(0, 2);
        core.add_transactions(vec![b"tx".to_vec()]);
        core.add_self_event().unwrap();
        core.run_consensus().unwrap();

        let block = core.get_block(0).unwrap();
        let sig = core.sign_block(&block).unwrap();
        core.add_block_signature(sig.clone());
        core.add_block_signature(sig);
        assert_eq!(core.get_block(0).unwrap().signatures.len(), 1);
    }

    #[test]
    fn signature_verifies_against_signed_body() {
        let (core, _rx) = make_core(0, 1);
        let mut block = Block::new(0, 0, vec![b"tx".to_vec()]);
        block.body.state_hash = vec![0xCC; 32];
        let sig = core.sign_block(&block).unwrap();
        assert!(core.keypair.verify(&block.body.hash(), &sig.signature));
    }

    #[test]
    fn inspection_surface() {
        let (mut core, _rx) = make_core(0, 2);
        core.add_transactions(vec![b"tx".to_vec()]);
        core.add_self_event().unwrap();
        core.run_consensus().unwrap();

        assert_eq!(core.participants().len(), 2);
        assert_eq!(core.last_round(), 0);
        assert_eq!(core.round_events(0), 1);
        assert_eq!(core.round_witnesses(0).len(), 1);
        assert_eq!(core.consensus_events().len(), 1);

        let last = core.last_event_from("peer-0").unwrap().unwrap();
        let event = core.get_event(&last).unwrap();
        assert_eq!(event.creator, 0);

        let root = core.get_root("peer-1").unwrap();
        assert_eq!(root.participant, 1);
        assert_eq!(root.index, -1);

        assert!(core.get_event("missing").is_err());
        assert!(core.get_round(7).is_err());
        assert!(core.get_block(7).is_err());
        assert!(core.get_root("stranger").is_err());
    }

    #[test]
    fn close_is_counted() {
        let (mut core, _rx) = make_core(0, 1);
        let probe = core.close_probe();
        core.close();
        assert_eq!(probe.load(Ordering::SeqCst), 1);
    }
}
