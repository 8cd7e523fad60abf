//! # Validator Node Runtime
//!
//! [`Node`] drives one validator through the gossip protocol: it owns the
//! ordering engine behind the core lock, exchanges events with peers in
//! pull-then-push rounds, and ships decided blocks to the application.
//!
//! ## Control planes
//!
//! Two cooperating loops run concurrently:
//!
//! - the **background dispatcher** serves inbound RPCs, transaction
//!   submissions, and decided blocks, in one sequential `select` loop —
//!   regardless of lifecycle state;
//! - the **state-machine loop** dispatches on the lifecycle state and, while
//!   `Gossiping`, waits for heartbeat ticks to launch outbound rounds. Its
//!   inner loop returns on every observed state change so the outer match
//!   re-dispatches.
//!
//! ## Locking discipline
//!
//! All engine access goes through one mutex (the core lock). It is held for
//! the duration of a single engine call — never across a transport round-trip
//! or the application's commit call. The peer selector has its own lock; the
//! lifecycle state is atomic.

pub mod peer;
pub mod routines;
pub mod state;
pub mod timer;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::config::NodeConfig;
use crate::consensus::{
    Block, ConsensusCore, CoreError, Event, EventId, KnownEvents, ParticipantId, Root, RoundInfo,
};
use crate::net::{
    EagerSyncRequest, EagerSyncResponse, Responder, Rpc, RpcRequest, RpcResponseBody, SyncRequest,
    SyncResponse, Transport, TransportError,
};
use crate::proxy::{AppProxy, ProxyError};

use peer::{Peer, PeerSelector, RandomPeerSelector};
use routines::RoutineTracker;
use state::{NodeState, State};
use timer::ControlTimer;

/// Errors surfaced by the node runtime.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Outcome of the pull phase of a gossip round.
#[derive(Debug)]
enum Pulled {
    /// The peer judged us too far behind for a normal diff.
    SyncLimit,
    /// Events were applied; the peer's digest drives the push phase.
    Known(KnownEvents),
}

/// Receiving channel halves, taken by [`Node::run`] exactly once.
struct NodeChannels {
    net_rx: mpsc::Receiver<Rpc>,
    submit_rx: mpsc::Receiver<Vec<u8>>,
    commit_rx: mpsc::Receiver<Block>,
    tick_rx: mpsc::Receiver<()>,
}

struct NodeInner<C, T, P> {
    id: ParticipantId,
    conf: NodeConfig,
    local_addr: String,

    /// The core lock: sole entry point to the ordering engine.
    core: Mutex<C>,
    selector: Mutex<Box<dyn PeerSelector>>,
    trans: T,
    proxy: P,

    state: NodeState,
    timer: ControlTimer,
    routines: RoutineTracker,
    shutdown_tx: watch::Sender<bool>,
    channels: Mutex<Option<NodeChannels>>,

    start: Instant,
    started_unix: i64,
    sync_requests: AtomicU64,
    sync_errors: AtomicU64,
}

/// A Weft validator node. Cheap to clone; every clone drives the same node.
pub struct Node<C, T, P> {
    inner: Arc<NodeInner<C, T, P>>,
}

impl<C, T, P> Clone for Node<C, T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, T, P> Node<C, T, P>
where
    C: ConsensusCore,
    T: Transport,
    P: AppProxy,
{
    /// Assembles a node over its collaborators, selecting gossip partners
    /// uniformly at random. `commit_rx` is the receiving half of the channel
    /// the engine publishes decided blocks on.
    pub fn new(
        conf: NodeConfig,
        id: ParticipantId,
        peers: Vec<Peer>,
        core: C,
        commit_rx: mpsc::Receiver<Block>,
        trans: T,
        proxy: P,
    ) -> Self {
        let local_addr = trans.local_addr();
        let selector = RandomPeerSelector::new(peers, local_addr.clone());
        Self::with_selector(conf, id, Box::new(selector), core, commit_rx, trans, proxy)
    }

    /// Like [`new`](Self::new), with a caller-supplied selection policy.
    pub fn with_selector(
        conf: NodeConfig,
        id: ParticipantId,
        selector: Box<dyn PeerSelector>,
        core: C,
        commit_rx: mpsc::Receiver<Block>,
        trans: T,
        proxy: P,
    ) -> Self {
        let local_addr = trans.local_addr();
        let net_rx = trans.consumer();
        let submit_rx = proxy.submit_ch();
        let timer = ControlTimer::new(conf.heartbeat);
        let tick_rx = timer.take_ticks();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(NodeInner {
                id,
                conf,
                local_addr,
                core: Mutex::new(core),
                selector: Mutex::new(selector),
                trans,
                proxy,
                state: NodeState::new(),
                timer,
                routines: RoutineTracker::new(),
                shutdown_tx,
                channels: Mutex::new(Some(NodeChannels {
                    net_rx,
                    submit_rx,
                    commit_rx,
                    tick_rx,
                })),
                start: Instant::now(),
                started_unix: chrono::Utc::now().timestamp(),
                sync_requests: AtomicU64::new(0),
                sync_errors: AtomicU64::new(0),
            }),
        }
    }

    /// This node's participant id.
    pub fn id(&self) -> ParticipantId {
        self.inner.id
    }

    /// The address this node's transport listens on.
    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.state.get()
    }

    /// Prepares the ordering engine. Called exactly once, before
    /// [`run`](Self::run); an error here means the node must not start.
    /// With `bootstrap` the engine replays persisted events instead of
    /// starting fresh.
    pub fn init(&self, bootstrap: bool) -> Result<(), NodeError> {
        let peer_addrs: Vec<String> = self
            .inner
            .selector
            .lock()
            .peers()
            .iter()
            .map(|p| p.net_addr.clone())
            .collect();
        debug!(id = self.inner.id, peers = ?peer_addrs, bootstrap, "init node");

        let mut core = self.inner.core.lock();
        if bootstrap {
            core.bootstrap()?;
        } else {
            core.init()?;
        }
        Ok(())
    }

    /// Spawns [`run`](Self::run) as a tracked background task.
    pub fn run_async(&self, gossip: bool) {
        let node = self.clone();
        self.inner.routines.spawn(async move { node.run(gossip).await });
    }

    /// Runs the node until shutdown. With `gossip` disabled the node only
    /// serves inbound traffic and never initiates rounds.
    pub async fn run(&self, gossip: bool) {
        let Some(channels) = self.inner.channels.lock().take() else {
            warn!(id = self.inner.id, "run called twice, ignoring");
            return;
        };
        let NodeChannels {
            net_rx,
            submit_rx,
            commit_rx,
            mut tick_rx,
        } = channels;

        // The heartbeat only matters while gossiping, but the timer task runs
        // for the node's whole life and is reined in via reset/stop.
        self.inner.timer.start();

        // Background work runs regardless of lifecycle state.
        let dispatcher = self.clone();
        self.inner
            .routines
            .spawn(async move { dispatcher.background_work(net_rx, submit_rx, commit_rx).await });

        loop {
            let state = self.inner.state.get();
            debug!(id = self.inner.id, %state, "run loop");
            match state {
                State::Gossiping => self.gossiping(gossip, &mut tick_rx).await,
                State::CatchingUp => self.fast_forward(),
                State::Shutdown => return,
            }
        }
    }

    /// The background dispatcher: inbound RPCs, submitted transactions, and
    /// decided blocks, handled sequentially until shutdown.
    async fn background_work(
        &self,
        mut net_rx: mpsc::Receiver<Rpc>,
        mut submit_rx: mpsc::Receiver<Vec<u8>>,
        mut commit_rx: mpsc::Receiver<Block>,
    ) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                Some(rpc) = net_rx.recv() => {
                    debug!(id = self.inner.id, "processing rpc");
                    self.process_rpc(rpc);
                    if self.inner.core.lock().need_gossip() && !self.inner.timer.is_set() {
                        self.inner.timer.reset().await;
                    }
                }
                Some(tx) = submit_rx.recv() => {
                    debug!(id = self.inner.id, "adding transaction");
                    self.add_transaction(tx);
                    if !self.inner.timer.is_set() {
                        self.inner.timer.reset().await;
                    }
                }
                Some(block) = commit_rx.recv() => {
                    debug!(
                        id = self.inner.id,
                        index = block.index(),
                        round_received = block.round_received(),
                        txs = block.transactions().len(),
                        "committing block"
                    );
                    if let Err(e) = self.commit(block).await {
                        error!(id = self.inner.id, error = %e, "committing block");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// The inner gossip loop: runs while the state stays `Gossiping`,
    /// launching one round per heartbeat tick.
    async fn gossiping(&self, gossip: bool, tick_rx: &mut mpsc::Receiver<()>) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            let old_state = self.inner.state.get();
            tokio::select! {
                Some(()) = tick_rx.recv() => {
                    // Outbound rounds happen only while actually gossiping;
                    // a tick that raced a state change initiates nothing.
                    if gossip && self.inner.state.get() == State::Gossiping {
                        match self.pre_gossip() {
                            Ok(true) => {
                                debug!(id = self.inner.id, "time to gossip");
                                let peer = self.inner.selector.lock().next();
                                match peer {
                                    Some(peer) => {
                                        let node = self.clone();
                                        self.inner.routines.spawn(async move {
                                            if let Err(e) = node.gossip(&peer.net_addr).await {
                                                debug!(
                                                    id = node.inner.id,
                                                    peer = %peer.net_addr,
                                                    error = %e,
                                                    "gossip round failed"
                                                );
                                            }
                                        });
                                    }
                                    None => debug!(id = self.inner.id, "no peer to gossip with"),
                                }
                            }
                            // Nothing to do, or already logged by pre_gossip.
                            Ok(false) | Err(_) => {}
                        }
                    }

                    // Reconcile the timer with whether another round is due.
                    if !self.inner.core.lock().need_gossip() {
                        self.inner.timer.stop().await;
                    } else if !self.inner.timer.is_set() {
                        self.inner.timer.reset().await;
                    }
                }
                _ = shutdown.changed() => return,
            }

            if self.inner.state.get() != old_state {
                return;
            }
        }
    }

    /// Catch-up stub: state transfer is not implemented, so this drops the
    /// node straight back into `Gossiping`.
    // TODO: negotiate a snapshot frame (last decided round, participant
    // roots, block tail) with the peer whose sync-limit response sent us
    // here, instead of resuming gossip from where we stopped.
    fn fast_forward(&self) {
        debug!(id = self.inner.id, "catching up");
        self.inner.state.set(State::Gossiping);
    }

    // -- Inbound ------------------------------------------------------------

    /// Serves one inbound RPC. Exactly one response is sent in every path.
    fn process_rpc(&self, rpc: Rpc) {
        let state = self.inner.state.get();
        if state != State::Gossiping {
            debug!(id = self.inner.id, %state, "discarding rpc request");
            let resp = SyncResponse::empty(self.inner.id);
            rpc.resp.respond(
                Some(RpcResponseBody::Sync(resp)),
                Some(format!("not ready: {state}")),
            );
            return;
        }

        let Rpc { request, resp } = rpc;
        match request {
            RpcRequest::Sync(cmd) => self.process_sync_request(cmd, resp),
            RpcRequest::EagerSync(cmd) => self.process_eager_sync_request(cmd, resp),
            other => {
                error!(id = self.inner.id, cmd = ?other, "unexpected rpc command");
                resp.respond(None, Some("unexpected command".to_string()));
            }
        }
    }

    /// Answers a peer's pull: sync-limit check, diff, wire conversion, own
    /// digest. Each engine call takes the core lock independently, so the
    /// digest may be newer than the diff — the peer reconciles next round.
    fn process_sync_request(&self, cmd: SyncRequest, resp: Responder) {
        debug!(
            id = self.inner.id,
            from_id = cmd.from_id,
            known = ?cmd.known,
            "process sync request"
        );

        let mut out = SyncResponse::empty(self.inner.id);
        let mut resp_err: Option<String> = None;

        let over_limit = self
            .inner
            .core
            .lock()
            .over_sync_limit(&cmd.known, self.inner.conf.sync_limit);
        if over_limit {
            debug!(id = self.inner.id, from_id = cmd.from_id, "sync limit");
            out.sync_limit = true;
        } else {
            let started = Instant::now();
            let diff = self.inner.core.lock().event_diff(&cmd.known);
            debug!(
                id = self.inner.id,
                duration_us = started.elapsed().as_micros() as u64,
                "event diff"
            );
            match diff {
                Err(e) => {
                    error!(id = self.inner.id, error = %e, "computing event diff");
                    resp_err = Some(e.to_string());
                }
                Ok(events) => match self.inner.core.lock().to_wire(events) {
                    Err(e) => {
                        debug!(id = self.inner.id, error = %e, "converting to wire events");
                        // Keep the first error; a later one is only logged.
                        if resp_err.is_none() {
                            resp_err = Some(e.to_string());
                        }
                    }
                    Ok(wire) => out.events = wire,
                },
            }
        }

        out.known = self.inner.core.lock().known_events();

        debug!(
            id = self.inner.id,
            events = out.events.len(),
            sync_limit = out.sync_limit,
            error = ?resp_err,
            "responding to sync request"
        );
        resp.respond(Some(RpcResponseBody::Sync(out)), resp_err);
    }

    /// Applies a peer's pushed events. The response carries `success` and,
    /// on failure, the error as well; the pusher retries on its next round,
    /// leaning on the engine's idempotent `sync`.
    fn process_eager_sync_request(&self, cmd: EagerSyncRequest, resp: Responder) {
        debug!(
            id = self.inner.id,
            from_id = cmd.from_id,
            events = cmd.events.len(),
            "process eager sync request"
        );

        let result = {
            let mut core = self.inner.core.lock();
            self.sync_events(&mut core, cmd.events)
        };
        if let Err(e) = &result {
            error!(id = self.inner.id, error = %e, "applying pushed events");
        }

        let out = EagerSyncResponse {
            from_id: self.inner.id,
            success: result.is_ok(),
        };
        resp.respond(
            Some(RpcResponseBody::EagerSync(out)),
            result.err().map(|e| e.to_string()),
        );
    }

    // -- Outbound -----------------------------------------------------------

    /// Decides whether a round is worth running and, if so, folds pending
    /// transactions into a new self-event. Runs under one core-lock hold.
    fn pre_gossip(&self) -> Result<bool, NodeError> {
        let mut core = self.inner.core.lock();

        if !core.need_gossip() && !self.inner.state.is_starting() {
            debug!(id = self.inner.id, "nothing to gossip");
            return Ok(false);
        }

        if let Err(e) = core.add_self_event() {
            error!(id = self.inner.id, error = %e, "adding self event");
            return Err(e.into());
        }
        Ok(true)
    }

    /// One pull-then-push round against `peer_addr`. Errors end the round;
    /// the next tick starts a fresh one.
    async fn gossip(&self, peer_addr: &str) -> Result<(), NodeError> {
        let other_known = match self.pull(peer_addr).await? {
            Pulled::SyncLimit => {
                debug!(id = self.inner.id, from = %peer_addr, "sync limit, catching up");
                self.inner.state.set(State::CatchingUp);
                return Ok(());
            }
            Pulled::Known(known) => known,
        };

        self.push(peer_addr, &other_known).await?;

        self.inner.selector.lock().update_last(peer_addr);
        self.log_stats();
        self.inner.state.set_starting(false);

        Ok(())
    }

    /// Pull phase: offer our digest, apply whatever the peer sends back.
    async fn pull(&self, peer_addr: &str) -> Result<Pulled, NodeError> {
        let known = self.inner.core.lock().known_events();

        let started = Instant::now();
        let resp = self.request_sync(peer_addr, known).await;
        debug!(
            id = self.inner.id,
            duration_us = started.elapsed().as_micros() as u64,
            "request sync"
        );
        let resp = match resp {
            Err(e) => {
                error!(id = self.inner.id, error = %e, "request sync");
                return Err(e.into());
            }
            Ok(resp) => resp,
        };
        debug!(
            id = self.inner.id,
            from_id = resp.from_id,
            sync_limit = resp.sync_limit,
            events = resp.events.len(),
            "sync response"
        );

        if resp.sync_limit {
            return Ok(Pulled::SyncLimit);
        }

        let result = {
            let mut core = self.inner.core.lock();
            self.sync_events(&mut core, resp.events)
        };
        if let Err(e) = result {
            error!(id = self.inner.id, error = %e, "applying pulled events");
            return Err(e.into());
        }

        Ok(Pulled::Known(resp.known))
    }

    /// Push phase: send the peer what it lacks, unless it is so far behind
    /// that flooding it would be counterproductive.
    async fn push(&self, peer_addr: &str, known: &KnownEvents) -> Result<(), NodeError> {
        let over_limit = self
            .inner
            .core
            .lock()
            .over_sync_limit(known, self.inner.conf.sync_limit);
        if over_limit {
            debug!(id = self.inner.id, to = %peer_addr, "peer over sync limit, skipping push");
            return Ok(());
        }

        let started = Instant::now();
        let diff = self.inner.core.lock().event_diff(known);
        debug!(
            id = self.inner.id,
            duration_us = started.elapsed().as_micros() as u64,
            "event diff"
        );
        let events = match diff {
            Err(e) => {
                error!(id = self.inner.id, error = %e, "computing event diff");
                return Err(e.into());
            }
            Ok(events) => events,
        };

        let wire = match self.inner.core.lock().to_wire(events) {
            Err(e) => {
                debug!(id = self.inner.id, error = %e, "converting to wire events");
                return Err(e.into());
            }
            Ok(wire) => wire,
        };

        let started = Instant::now();
        let resp = self.request_eager_sync(peer_addr, wire).await;
        debug!(
            id = self.inner.id,
            duration_us = started.elapsed().as_micros() as u64,
            "request eager sync"
        );
        let resp = match resp {
            Err(e) => {
                error!(id = self.inner.id, error = %e, "request eager sync");
                return Err(e.into());
            }
            Ok(resp) => resp,
        };
        debug!(
            id = self.inner.id,
            from_id = resp.from_id,
            success = resp.success,
            "eager sync response"
        );

        Ok(())
    }

    async fn request_sync(
        &self,
        target: &str,
        known: KnownEvents,
    ) -> Result<SyncResponse, TransportError> {
        self.inner.sync_requests.fetch_add(1, Ordering::Relaxed);
        let req = SyncRequest {
            from_id: self.inner.id,
            known,
        };
        let result = self.inner.trans.sync(target, req).await;
        if result.is_err() {
            self.inner.sync_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn request_eager_sync(
        &self,
        target: &str,
        events: Vec<crate::consensus::WireEvent>,
    ) -> Result<EagerSyncResponse, TransportError> {
        let req = EagerSyncRequest {
            from_id: self.inner.id,
            events,
        };
        self.inner.trans.eager_sync(target, req).await
    }

    /// Inserts a batch of events and advances the ordering. The caller holds
    /// the core lock for both calls.
    fn sync_events(
        &self,
        core: &mut C,
        events: Vec<crate::consensus::WireEvent>,
    ) -> Result<(), CoreError> {
        let started = Instant::now();
        core.sync(events)?;
        debug!(
            id = self.inner.id,
            duration_us = started.elapsed().as_micros() as u64,
            "sync"
        );

        let started = Instant::now();
        core.run_consensus()?;
        debug!(
            id = self.inner.id,
            duration_us = started.elapsed().as_micros() as u64,
            "run consensus"
        );
        Ok(())
    }

    // -- Commit pipeline ----------------------------------------------------

    /// Ships one decided block to the application, folds its state hash into
    /// the block, and attaches our signature. The proxy call happens outside
    /// the core lock so application latency never serializes with DAG
    /// progress.
    async fn commit(&self, mut block: Block) -> Result<(), NodeError> {
        let result = self.inner.proxy.commit_block(block.clone()).await;
        let state_hash = match &result {
            Ok(hash) => hash.clone(),
            // The block is still signed, over whatever the state hash field
            // holds; the application's failure is its own problem to replay.
            Err(_) => Vec::new(),
        };
        debug!(
            id = self.inner.id,
            block = block.index(),
            state_hash = %hex::encode(&state_hash),
            ok = result.is_ok(),
            "commit block response"
        );
        if let Err(e) = result {
            warn!(id = self.inner.id, block = block.index(), error = %e, "application rejected block");
        }

        block.body.state_hash = state_hash;

        let mut core = self.inner.core.lock();
        let sig = core.sign_block(&block)?;
        core.add_block_signature(sig);
        Ok(())
    }

    /// Appends one submitted transaction to the engine's pending pool.
    fn add_transaction(&self, tx: Vec<u8>) {
        self.inner.core.lock().add_transactions(vec![tx]);
    }

    // -- Shutdown -----------------------------------------------------------

    /// Shuts the node down: terminal state, signal every loop, wait for
    /// tracked tasks, stop the timer, then close the transport and the
    /// engine's store — strictly after all concurrent work has drained, so
    /// nothing races a closed handle. Idempotent; never fails.
    pub async fn shutdown(&self) {
        if !self.inner.state.shutdown() {
            return;
        }
        debug!(id = self.inner.id, "shutdown");

        let _ = self.inner.shutdown_tx.send(true);
        self.inner.routines.wait().await;
        self.inner.timer.shutdown().await;

        self.inner.trans.close();
        self.inner.core.lock().close();
    }

    // -- Stats and inspection -----------------------------------------------

    /// Fraction of outbound sync requests that succeeded; 1 when none have
    /// been made.
    pub fn sync_rate(&self) -> f64 {
        let requests = self.inner.sync_requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 1.0;
        }
        let errors = self.inner.sync_errors.load(Ordering::Relaxed);
        1.0 - errors as f64 / requests as f64
    }

    /// Observable rate statistics, as a string map for easy export.
    pub fn get_stats(&self) -> BTreeMap<String, String> {
        let elapsed = self.inner.start.elapsed().as_secs_f64();

        let (
            consensus_events,
            consensus_transactions,
            last_consensus_round,
            last_block_index,
            undetermined_events,
            transaction_pool,
            round_events,
        ) = {
            let core = self.inner.core.lock();
            (
                core.consensus_events_count(),
                core.consensus_transactions_count(),
                core.last_consensus_round(),
                core.last_block_index(),
                core.undetermined_events_count(),
                core.transaction_pool_len(),
                core.last_round_events_count(),
            )
        };
        let num_peers = self.inner.selector.lock().peers().len();

        let events_per_second = consensus_events as f64 / elapsed;
        let transactions_per_second = consensus_transactions as f64 / elapsed;
        let rounds_per_second = last_consensus_round
            .map(|round| round as f64 / elapsed)
            .unwrap_or(0.0);

        let mut stats = BTreeMap::new();
        stats.insert(
            "last_consensus_round".to_string(),
            last_consensus_round
                .map(|round| round.to_string())
                .unwrap_or_else(|| "nil".to_string()),
        );
        stats.insert("time_elapsed".to_string(), format!("{elapsed:.2}"));
        stats.insert(
            "heartbeat".to_string(),
            format!("{:.2}", self.inner.conf.heartbeat.as_secs_f64()),
        );
        stats.insert(
            "node_current".to_string(),
            chrono::Utc::now().timestamp().to_string(),
        );
        stats.insert("node_start".to_string(), self.inner.started_unix.to_string());
        stats.insert("last_block_index".to_string(), last_block_index.to_string());
        stats.insert("consensus_events".to_string(), consensus_events.to_string());
        stats.insert("sync_limit".to_string(), self.inner.conf.sync_limit.to_string());
        stats.insert(
            "consensus_transactions".to_string(),
            consensus_transactions.to_string(),
        );
        stats.insert(
            "undetermined_events".to_string(),
            undetermined_events.to_string(),
        );
        stats.insert("transaction_pool".to_string(), transaction_pool.to_string());
        stats.insert("num_peers".to_string(), num_peers.to_string());
        stats.insert("sync_rate".to_string(), format!("{:.2}", self.sync_rate()));
        stats.insert(
            "transactions_per_second".to_string(),
            format!("{transactions_per_second:.2}"),
        );
        stats.insert(
            "events_per_second".to_string(),
            format!("{events_per_second:.2}"),
        );
        stats.insert(
            "rounds_per_second".to_string(),
            format!("{rounds_per_second:.2}"),
        );
        stats.insert("round_events".to_string(), round_events.to_string());
        stats.insert("id".to_string(), self.inner.id.to_string());
        stats.insert("state".to_string(), self.inner.state.get().to_string());
        stats
    }

    fn log_stats(&self) {
        let stats = self.get_stats();
        debug!(
            id = self.inner.id,
            last_consensus_round = %stats["last_consensus_round"],
            last_block_index = %stats["last_block_index"],
            consensus_events = %stats["consensus_events"],
            consensus_transactions = %stats["consensus_transactions"],
            undetermined_events = %stats["undetermined_events"],
            transaction_pool = %stats["transaction_pool"],
            num_peers = %stats["num_peers"],
            sync_rate = %stats["sync_rate"],
            events_per_second = %stats["events_per_second"],
            rounds_per_second = %stats["rounds_per_second"],
            round_events = %stats["round_events"],
            state = %stats["state"],
            "stats"
        );
    }

    /// The fixed participant set, address → id.
    pub fn get_participants(&self) -> BTreeMap<String, ParticipantId> {
        self.inner.core.lock().participants()
    }

    /// Fetches an event by id.
    pub fn get_event(&self, id: &str) -> Result<Event, NodeError> {
        Ok(self.inner.core.lock().get_event(id)?)
    }

    /// Id of the most recent event authored by `participant`.
    pub fn get_last_event_from(&self, participant: &str) -> Result<Option<EventId>, NodeError> {
        Ok(self.inner.core.lock().last_event_from(participant)?)
    }

    /// Snapshot of the anti-entropy digest.
    pub fn get_known_events(&self) -> KnownEvents {
        self.inner.core.lock().known_events()
    }

    /// Ids of all settled events, in consensus order.
    pub fn get_consensus_events(&self) -> Vec<EventId> {
        self.inner.core.lock().consensus_events()
    }

    /// Summary of a decided round.
    pub fn get_round(&self, index: i64) -> Result<RoundInfo, NodeError> {
        Ok(self.inner.core.lock().get_round(index)?)
    }

    /// Index of the last decided round, `-1` if none.
    pub fn get_last_round(&self) -> i64 {
        self.inner.core.lock().last_round()
    }

    /// Witnesses of a decided round.
    pub fn get_round_witnesses(&self, index: i64) -> Vec<EventId> {
        self.inner.core.lock().round_witnesses(index)
    }

    /// Number of events in a decided round.
    pub fn get_round_events(&self, index: i64) -> usize {
        self.inner.core.lock().round_events(index)
    }

    /// The baseline pseudo-event for a participant.
    pub fn get_root(&self, participant: &str) -> Result<Root, NodeError> {
        Ok(self.inner.core.lock().get_root(participant)?)
    }

    /// Fetches a decided block by index.
    pub fn get_block(&self, index: i64) -> Result<Block, NodeError> {
        Ok(self.inner.core.lock().get_block(index)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::COMMIT_CHANNEL_CAPACITY;
    use crate::consensus::InmemCore;
    use crate::keys::Keypair;
    use crate::net::inmem::{InmemNetwork, InmemTransport};
    use crate::net::FastForwardRequest;
    use crate::proxy::inmem::InmemAppProxy;

    type TestNode = Node<InmemCore, InmemTransport, Arc<InmemAppProxy>>;

    fn addr(id: u64) -> String {
        format!("weft://node-{id}")
    }

    fn make_node(
        network: &InmemNetwork,
        id: u64,
        cluster: u64,
        conf: NodeConfig,
    ) -> (TestNode, Arc<InmemAppProxy>) {
        let peers: Vec<Peer> = (0..cluster)
            .map(|i| Peer::new(i, addr(i), format!("{i:064x}")))
            .collect();
        let participants: BTreeMap<String, ParticipantId> =
            peers.iter().map(|p| (p.net_addr.clone(), p.id)).collect();

        let (commit_tx, commit_rx) = mpsc::channel(COMMIT_CHANNEL_CAPACITY);
        let core = InmemCore::new(id, Keypair::generate(), participants, commit_tx);
        let trans = network.transport(addr(id));
        let proxy = Arc::new(InmemAppProxy::new());
        let node = Node::new(
            conf,
            id,
            peers,
            core,
            commit_rx,
            trans,
            Arc::clone(&proxy),
        );
        (node, proxy)
    }

    /// Seeds `count` single-transaction self-events into the node's engine.
    fn seed_self_events(node: &TestNode, count: usize) {
        for i in 0..count {
            node.add_transaction(format!("tx-{i}").into_bytes());
            assert!(node.pre_gossip().unwrap());
        }
    }

    #[tokio::test]
    async fn rpc_outside_gossiping_gets_not_ready_and_core_is_untouched() {
        let network = InmemNetwork::new();
        let (node, _proxy) = make_node(&network, 0, 2, NodeConfig::default());
        node.inner.state.set(State::CatchingUp);

        let known_before = node.get_known_events();
        let (rpc, reply_rx) = Rpc::new(RpcRequest::Sync(SyncRequest {
            from_id: 1,
            known: KnownEvents::new(),
        }));
        node.process_rpc(rpc);

        let reply = reply_rx.await.unwrap();
        match reply.body {
            Some(RpcResponseBody::Sync(resp)) => {
                assert_eq!(resp.from_id, 0);
                assert!(resp.events.is_empty());
            }
            other => panic!("expected sync body, got {other:?}"),
        }
        assert!(reply.error.unwrap().contains("not ready: CatchingUp"));
        assert_eq!(node.get_known_events(), known_before);
    }

    #[tokio::test]
    async fn unexpected_command_is_rejected() {
        let network = InmemNetwork::new();
        let (node, _proxy) = make_node(&network, 0, 2, NodeConfig::default());

        let (rpc, reply_rx) = Rpc::new(RpcRequest::FastForward(FastForwardRequest { from_id: 1 }));
        node.process_rpc(rpc);

        let reply = reply_rx.await.unwrap();
        assert!(reply.body.is_none());
        assert_eq!(reply.error.as_deref(), Some("unexpected command"));
    }

    #[tokio::test]
    async fn sync_request_returns_diff_and_own_digest() {
        let network = InmemNetwork::new();
        let (node, _proxy) = make_node(&network, 0, 2, NodeConfig::default());
        seed_self_events(&node, 2);

        let (rpc, reply_rx) = Rpc::new(RpcRequest::Sync(SyncRequest {
            from_id: 1,
            known: [(0, 0), (1, -1)].into(),
        }));
        node.process_rpc(rpc);

        let reply = reply_rx.await.unwrap();
        assert!(reply.error.is_none());
        match reply.body {
            Some(RpcResponseBody::Sync(resp)) => {
                assert!(!resp.sync_limit);
                // The peer already has our event 0; only event 1 travels.
                assert_eq!(resp.events.len(), 1);
                assert_eq!(resp.events[0].index, 1);
                assert_eq!(resp.known.get(&0), Some(&1));
            }
            other => panic!("expected sync body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_peer_is_told_sync_limit_instead_of_diffed() {
        let network = InmemNetwork::new();
        let conf = NodeConfig::new(std::time::Duration::from_millis(20), 1);
        let (node, _proxy) = make_node(&network, 0, 2, conf);
        seed_self_events(&node, 3);

        let (rpc, reply_rx) = Rpc::new(RpcRequest::Sync(SyncRequest {
            from_id: 1,
            known: [(0, -1), (1, -1)].into(),
        }));
        node.process_rpc(rpc);

        let reply = reply_rx.await.unwrap();
        assert!(reply.error.is_none());
        match reply.body {
            Some(RpcResponseBody::Sync(resp)) => {
                assert!(resp.sync_limit);
                assert!(resp.events.is_empty());
            }
            other => panic!("expected sync body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eager_sync_failure_reports_both_signals() {
        let network = InmemNetwork::new();
        let (node, _proxy) = make_node(&network, 0, 2, NodeConfig::default());

        let stray = crate::consensus::WireEvent {
            creator: 99,
            index: 0,
            transactions: vec![],
        };
        let (rpc, reply_rx) = Rpc::new(RpcRequest::EagerSync(EagerSyncRequest {
            from_id: 1,
            events: vec![stray],
        }));
        node.process_rpc(rpc);

        let reply = reply_rx.await.unwrap();
        match reply.body {
            Some(RpcResponseBody::EagerSync(resp)) => assert!(!resp.success),
            other => panic!("expected eager sync body, got {other:?}"),
        }
        assert!(reply.error.unwrap().contains("unknown participant"));
    }

    #[tokio::test]
    async fn push_skips_a_peer_over_the_sync_limit() {
        let network = InmemNetwork::new();
        let conf = NodeConfig::new(std::time::Duration::from_millis(20), 1);
        let (node, _proxy) = make_node(&network, 0, 2, conf);
        seed_self_events(&node, 3);

        // Far behind: the push is skipped before any transport traffic, so
        // the unreachable address never matters.
        let behind: KnownEvents = [(0, -1), (1, -1)].into();
        node.push("weft://nowhere", &behind).await.unwrap();

        // Caught up: the push proceeds and hits the dead address.
        let caught_up: KnownEvents = [(0, 2), (1, -1)].into();
        let err = node.push("weft://nowhere", &caught_up).await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::Transport(TransportError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn pull_sync_limit_transitions_to_catching_up() {
        let network = InmemNetwork::new();
        let (node, _proxy) = make_node(&network, 0, 2, NodeConfig::default());

        // A bare responder standing in for the peer: it reports sync limit.
        let peer = network.transport(addr(1));
        let mut inbox = peer.consumer();
        tokio::spawn(async move {
            let rpc = inbox.recv().await.unwrap();
            let mut resp = SyncResponse::empty(1);
            resp.sync_limit = true;
            rpc.resp.respond(Some(RpcResponseBody::Sync(resp)), None);
        });

        node.gossip(&addr(1)).await.unwrap();
        assert_eq!(node.state(), State::CatchingUp);
    }

    #[tokio::test]
    async fn commit_failure_still_signs_the_block() {
        let network = InmemNetwork::new();
        let (node, proxy) = make_node(&network, 0, 2, NodeConfig::default());
        seed_self_events(&node, 1);

        // An empty eager sync drives run_consensus, deciding the block.
        let (rpc, reply_rx) = Rpc::new(RpcRequest::EagerSync(EagerSyncRequest {
            from_id: 1,
            events: vec![],
        }));
        node.process_rpc(rpc);
        assert!(reply_rx.await.unwrap().error.is_none());

        let mut channels = node.inner.channels.lock().take().unwrap();
        let block = channels.commit_rx.recv().await.unwrap();

        proxy.set_fail_commits(true);
        node.commit(block).await.unwrap();

        let signed = node.get_block(0).unwrap();
        assert_eq!(signed.signatures.len(), 1);
        assert_eq!(signed.signatures[0].validator, 0);
        assert_eq!(proxy.committed_count(), 0);
    }

    #[tokio::test]
    async fn sync_rate_reflects_errors_and_formats_two_decimals() {
        let network = InmemNetwork::new();
        let (node, _proxy) = make_node(&network, 0, 2, NodeConfig::default());

        assert_eq!(node.sync_rate(), 1.0);
        node.inner.sync_requests.store(5, Ordering::Relaxed);
        node.inner.sync_errors.store(1, Ordering::Relaxed);

        assert!((node.sync_rate() - 0.8).abs() < f64::EPSILON);
        assert_eq!(node.get_stats()["sync_rate"], "0.80");
    }

    #[tokio::test]
    async fn fresh_node_stats() {
        let network = InmemNetwork::new();
        let (node, _proxy) = make_node(&network, 3, 4, NodeConfig::default());

        let stats = node.get_stats();
        assert_eq!(stats["last_consensus_round"], "nil");
        assert_eq!(stats["consensus_events"], "0");
        assert_eq!(stats["last_block_index"], "-1");
        assert_eq!(stats["transaction_pool"], "0");
        assert_eq!(stats["num_peers"], "4");
        assert_eq!(stats["id"], "3");
        assert_eq!(stats["state"], "Gossiping");
        assert_eq!(stats["rounds_per_second"], "0.00");
    }

    #[tokio::test]
    async fn failed_outbound_sync_is_counted() {
        let network = InmemNetwork::new();
        let (node, _proxy) = make_node(&network, 0, 2, NodeConfig::default());

        let err = node.pull("weft://nowhere").await.unwrap_err();
        assert!(matches!(err, NodeError::Transport(_)));
        assert_eq!(node.inner.sync_requests.load(Ordering::Relaxed), 1);
        assert_eq!(node.inner.sync_errors.load(Ordering::Relaxed), 1);
        assert_eq!(node.get_stats()["sync_rate"], "0.00");
    }
}
