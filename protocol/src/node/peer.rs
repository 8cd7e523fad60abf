//! Peers and gossip-partner selection.
//!
//! The runtime treats the selection policy as opaque: anything implementing
//! [`PeerSelector`] can decide who the next gossip round targets. The default
//! policy is uniform random over everyone except ourselves and, when more
//! than two peers exist, except the previously chosen partner — repeatedly
//! hammering the same peer defeats the point of epidemic dissemination.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::consensus::ParticipantId;

/// A member of the fixed participant set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Integer id, unique within the participant set.
    pub id: ParticipantId,
    /// Network address the peer's transport listens on.
    pub net_addr: String,
    /// Hex-encoded Ed25519 public key.
    pub pub_key_hex: String,
}

impl Peer {
    pub fn new(
        id: ParticipantId,
        net_addr: impl Into<String>,
        pub_key_hex: impl Into<String>,
    ) -> Self {
        Self {
            id,
            net_addr: net_addr.into(),
            pub_key_hex: pub_key_hex.into(),
        }
    }
}

/// Chooses the next gossip partner. Implementations are consulted under the
/// node's selector lock, so `&mut self` here needs no further synchronization.
pub trait PeerSelector: Send + 'static {
    /// The full participant set this selector draws from.
    fn peers(&self) -> &[Peer];

    /// The next gossip partner, or `None` when no peer is selectable (a
    /// single-node cluster must be able to idle without crashing).
    fn next(&self) -> Option<Peer>;

    /// Records the address of the peer a round was completed with.
    fn update_last(&mut self, addr: &str);
}

/// The default uniform-random policy.
pub struct RandomPeerSelector {
    peers: Vec<Peer>,
    local_addr: String,
    last: Option<String>,
}

impl RandomPeerSelector {
    /// Builds a selector over `peers` for the node listening on `local_addr`.
    pub fn new(peers: Vec<Peer>, local_addr: impl Into<String>) -> Self {
        Self {
            peers,
            local_addr: local_addr.into(),
            last: None,
        }
    }
}

impl PeerSelector for RandomPeerSelector {
    fn peers(&self) -> &[Peer] {
        &self.peers
    }

    fn next(&self) -> Option<Peer> {
        let selectable: Vec<&Peer> = self
            .peers
            .iter()
            .filter(|p| p.net_addr != self.local_addr)
            .collect();

        let candidates: Vec<&Peer> = match &self.last {
            // With a single reachable peer there is nobody else to rotate
            // to, so the last-partner exclusion only applies beyond that.
            Some(last) if selectable.len() > 1 => selectable
                .into_iter()
                .filter(|p| p.net_addr != *last)
                .collect(),
            _ => selectable,
        };

        candidates.choose(&mut rand::thread_rng()).map(|p| (*p).clone())
    }

    fn update_last(&mut self, addr: &str) {
        self.last = Some(addr.to_string());
    }
}
