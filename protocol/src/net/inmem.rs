//! In-process transport for devnets and multi-node tests.
//!
//! An [`InmemNetwork`] is a routing hub: every [`InmemTransport`] created
//! from it registers its address, and outbound requests are delivered by
//! enqueuing an [`Rpc`] envelope on the target's consumer channel and
//! awaiting the one-shot reply. There are no sockets, no serialization, and
//! no artificial latency — which makes races *more* likely than on a real
//! network, not less, and that is the point for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::RPC_CHANNEL_CAPACITY;

use super::{
    EagerSyncRequest, EagerSyncResponse, Responder, Rpc, RpcReply, RpcRequest, RpcResponseBody,
    SyncRequest, SyncResponse, Transport, TransportError,
};

type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<Rpc>>>>;

/// Per-request deadline. Nothing in-process should ever take this long; the
/// deadline exists so a peer that holds a request without answering cannot
/// wedge the caller's gossip task forever.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Routing hub connecting the in-memory transports of one process.
#[derive(Clone, Default)]
pub struct InmemNetwork {
    routes: Routes,
}

impl InmemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a transport reachable under `addr`.
    pub fn transport(&self, addr: impl Into<String>) -> InmemTransport {
        let addr = addr.into();
        let (inbound_tx, inbound_rx) = mpsc::channel(RPC_CHANNEL_CAPACITY);
        self.routes.lock().insert(addr.clone(), inbound_tx);
        InmemTransport {
            addr,
            routes: Arc::clone(&self.routes),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether `addr` is currently reachable (registered and not closed).
    pub fn is_reachable(&self, addr: &str) -> bool {
        self.routes.lock().contains_key(addr)
    }
}

/// One endpoint of an [`InmemNetwork`].
pub struct InmemTransport {
    addr: String,
    routes: Routes,
    inbound_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    closed: AtomicBool,
}

impl InmemTransport {
    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        target: &str,
        request: RpcRequest,
    ) -> Result<RpcReply, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let peer_tx = self
            .routes
            .lock()
            .get(target)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(target.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let rpc = Rpc {
            request,
            resp: Responder { tx: reply_tx },
        };
        peer_tx
            .send(rpc)
            .await
            .map_err(|_| TransportError::UnknownPeer(target.to_string()))?;

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, reply_rx)
            .await
            .map_err(|_| TransportError::Timeout(target.to_string()))?
            .map_err(|_| TransportError::NoResponse(target.to_string()))?;
        if let Some(error) = reply.error {
            return Err(TransportError::Remote(error));
        }
        Ok(reply)
    }
}

impl Transport for InmemTransport {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    fn consumer(&self) -> mpsc::Receiver<Rpc> {
        match self.inbound_rx.lock().take() {
            Some(rx) => rx,
            None => {
                // Second take: hand back a channel that is already closed so
                // the misuse is visible immediately instead of hanging.
                debug!(addr = %self.addr, "consumer taken twice");
                mpsc::channel(1).1
            }
        }
    }

    async fn sync(
        &self,
        target: &str,
        req: SyncRequest,
    ) -> Result<SyncResponse, TransportError> {
        match self.request(target, RpcRequest::Sync(req)).await?.body {
            Some(RpcResponseBody::Sync(resp)) => Ok(resp),
            _ => Err(TransportError::NoResponse(target.to_string())),
        }
    }

    async fn eager_sync(
        &self,
        target: &str,
        req: EagerSyncRequest,
    ) -> Result<EagerSyncResponse, TransportError> {
        match self.request(target, RpcRequest::EagerSync(req)).await?.body {
            Some(RpcResponseBody::EagerSync(resp)) => Ok(resp),
            _ => Err(TransportError::NoResponse(target.to_string())),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.routes.lock().remove(&self.addr);
            debug!(addr = %self.addr, "transport closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::KnownEvents;

    fn sync_req(from_id: u64) -> SyncRequest {
        SyncRequest {
            from_id,
            known: KnownEvents::new(),
        }
    }

    #[tokio::test]
    async fn routes_request_and_reply() {
        let network = InmemNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        let mut b_inbox = b.consumer();
        tokio::spawn(async move {
            let rpc = b_inbox.recv().await.unwrap();
            assert!(matches!(rpc.request, RpcRequest::Sync(ref r) if r.from_id == 0));
            rpc.resp
                .respond(Some(RpcResponseBody::Sync(SyncResponse::empty(1))), None);
        });

        let resp = a.sync("b", sync_req(0)).await.unwrap();
        assert_eq!(resp.from_id, 1);
    }

    #[tokio::test]
    async fn remote_error_surfaces_as_transport_error() {
        let network = InmemNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        let mut b_inbox = b.consumer();
        tokio::spawn(async move {
            let rpc = b_inbox.recv().await.unwrap();
            rpc.resp.respond(
                Some(RpcResponseBody::Sync(SyncResponse::empty(1))),
                Some("not ready: CatchingUp".to_string()),
            );
        });

        let err = a.sync("b", sync_req(0)).await.unwrap_err();
        assert!(matches!(err, TransportError::Remote(msg) if msg.contains("not ready")));
    }

    #[tokio::test]
    async fn unknown_peer_is_rejected() {
        let network = InmemNetwork::new();
        let a = network.transport("a");
        let err = a.sync("nowhere", sync_req(0)).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn closed_transport_refuses_outbound_and_deregisters() {
        let network = InmemNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        b.close();
        b.close(); // idempotent
        assert!(b.is_closed());
        assert!(!network.is_reachable("b"));

        let err = a.sync("b", sync_req(0)).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));

        a.close();
        let err = a.sync("b", sync_req(0)).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn dropped_inbox_means_no_response() {
        let network = InmemNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        // Target exists but nobody serves its inbox.
        drop(b.consumer());
        let err = a.sync("b", sync_req(0)).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::UnknownPeer(_) | TransportError::NoResponse(_)
        ));
    }
}
