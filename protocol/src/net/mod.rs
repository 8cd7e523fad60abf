//! # Network Interface
//!
//! The transport contract the node runtime consumes, the sync wire messages,
//! and the inbound RPC envelope. A transport owns two directions:
//!
//! - **outbound** — [`Transport::sync`] and [`Transport::eager_sync`] send a
//!   request to a peer's address and resolve with its response;
//! - **inbound** — peers' requests surface on the consumer channel as
//!   [`Rpc`] envelopes, each carrying a one-shot [`Responder`] that must be
//!   used exactly once.
//!
//! An application-level error on the remote side travels back through the
//! same reply and surfaces as [`TransportError::Remote`], so a caller cannot
//! mistake "the peer refused" for "the peer agreed".
//!
//! The crate ships one implementation, [`inmem::InmemTransport`], which
//! routes between nodes of a single process. Socket transports implement the
//! same trait out of tree.

pub mod inmem;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::consensus::{KnownEvents, ParticipantId, WireEvent};

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No peer is reachable under the target address.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// The local transport has been closed.
    #[error("transport closed")]
    Closed,

    /// The peer accepted the connection but never responded.
    #[error("no response from {0}")]
    NoResponse(String),

    /// The peer did not respond within the transport's deadline.
    #[error("request to {0} timed out")]
    Timeout(String),

    /// The peer responded with an application-level error.
    #[error("remote error: {0}")]
    Remote(String),
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Pull request: "here is what I know, send me what I lack".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from_id: ParticipantId,
    pub known: KnownEvents,
}

/// Pull response. When `sync_limit` is set the peer judged the caller too far
/// behind for a normal diff and `events` is empty — the caller should enter
/// catch-up instead of syncing event by event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub from_id: ParticipantId,
    pub known: KnownEvents,
    pub sync_limit: bool,
    pub events: Vec<WireEvent>,
}

impl SyncResponse {
    /// A response carrying only the sender id, the shape used for errors.
    pub fn empty(from_id: ParticipantId) -> Self {
        Self {
            from_id,
            known: KnownEvents::new(),
            sync_limit: false,
            events: Vec::new(),
        }
    }
}

/// Push request: unsolicited delivery of events the sender believes the
/// target lacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EagerSyncRequest {
    pub from_id: ParticipantId,
    pub events: Vec<WireEvent>,
}

/// Push acknowledgement. `success` mirrors whether the events were applied;
/// on failure the RPC error carries the reason as well — consumers must
/// tolerate both signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EagerSyncResponse {
    pub from_id: ParticipantId,
    pub success: bool,
}

/// Opening message of the catch-up negotiation: asks a peer for a snapshot
/// frame to fast-forward from. Part of the wire vocabulary, but the runtime
/// does not serve it yet and answers "unexpected command".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastForwardRequest {
    pub from_id: ParticipantId,
}

/// The typed command carried by an inbound RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequest {
    Sync(SyncRequest),
    EagerSync(EagerSyncRequest),
    FastForward(FastForwardRequest),
}

/// The typed body of an RPC reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResponseBody {
    Sync(SyncResponse),
    EagerSync(EagerSyncResponse),
}

/// A complete reply: optional body plus optional application-level error.
/// Both can be present at once (a response populated as far as possible,
/// with the first error encountered alongside).
#[derive(Debug)]
pub struct RpcReply {
    pub body: Option<RpcResponseBody>,
    pub error: Option<String>,
}

/// One-shot reply channel for an inbound RPC. Consuming `respond` is the only
/// way to use it, so each RPC is answered at most once; dropping it without
/// responding surfaces as [`TransportError::NoResponse`] on the caller side.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<RpcReply>,
}

impl Responder {
    /// Sends the reply. Errors are ignored: a vanished caller is its own
    /// timeout problem, not ours.
    pub fn respond(self, body: Option<RpcResponseBody>, error: Option<String>) {
        let _ = self.tx.send(RpcReply { body, error });
    }
}

/// An inbound RPC as delivered on a transport's consumer channel.
#[derive(Debug)]
pub struct Rpc {
    pub request: RpcRequest,
    pub resp: Responder,
}

impl Rpc {
    /// Pairs a request with a fresh reply channel. Used by transports when
    /// surfacing an inbound request, and by tests injecting RPCs directly.
    pub fn new(request: RpcRequest) -> (Self, oneshot::Receiver<RpcReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                resp: Responder { tx },
            },
            rx,
        )
    }
}

// ---------------------------------------------------------------------------
// Transport contract
// ---------------------------------------------------------------------------

/// A bidirectional RPC transport between validators.
pub trait Transport: Send + Sync + 'static {
    /// The address peers can reach this transport under.
    fn local_addr(&self) -> String;

    /// Takes the inbound RPC stream. Single consumer: the first call returns
    /// the live channel, subsequent calls return a closed one.
    fn consumer(&self) -> mpsc::Receiver<Rpc>;

    /// Sends a pull request to `target` and awaits its response.
    fn sync(
        &self,
        target: &str,
        req: SyncRequest,
    ) -> impl Future<Output = Result<SyncResponse, TransportError>> + Send;

    /// Sends a push request to `target` and awaits its acknowledgement.
    fn eager_sync(
        &self,
        target: &str,
        req: EagerSyncRequest,
    ) -> impl Future<Output = Result<EagerSyncResponse, TransportError>> + Send;

    /// Closes the transport. Idempotent; outbound calls fail with
    /// [`TransportError::Closed`] afterwards.
    fn close(&self);
}

/// Sharing a transport between the node and its host process is common
/// (the host may want to close it or inspect it), so `Arc<T>` transports
/// delegate to their inner value.
impl<T: Transport> Transport for std::sync::Arc<T> {
    fn local_addr(&self) -> String {
        (**self).local_addr()
    }

    fn consumer(&self) -> mpsc::Receiver<Rpc> {
        (**self).consumer()
    }

    async fn sync(&self, target: &str, req: SyncRequest) -> Result<SyncResponse, TransportError> {
        (**self).sync(target, req).await
    }

    async fn eager_sync(
        &self,
        target: &str,
        req: EagerSyncRequest,
    ) -> Result<EagerSyncResponse, TransportError> {
        (**self).eager_sync(target, req).await
    }

    fn close(&self) {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responder_is_single_shot_and_delivers() {
        let (rpc, rx) = Rpc::new(RpcRequest::FastForward(FastForwardRequest { from_id: 1 }));
        rpc.resp
            .respond(None, Some("unexpected command".to_string()));
        let reply = rx.await.unwrap();
        assert!(reply.body.is_none());
        assert_eq!(reply.error.as_deref(), Some("unexpected command"));
    }

    #[tokio::test]
    async fn dropped_responder_closes_the_reply_channel() {
        let (rpc, rx) = Rpc::new(RpcRequest::Sync(SyncRequest {
            from_id: 0,
            known: KnownEvents::new(),
        }));
        drop(rpc);
        assert!(rx.await.is_err());
    }

    #[test]
    fn empty_sync_response_only_carries_sender() {
        let resp = SyncResponse::empty(7);
        assert_eq!(resp.from_id, 7);
        assert!(resp.known.is_empty());
        assert!(resp.events.is_empty());
        assert!(!resp.sync_limit);
    }
}
