//! In-process application proxy for devnets and tests.
//!
//! Plays the application's role well enough to observe the runtime from the
//! outside: committed blocks are recorded in order, and the state digest is a
//! running hash chained over each block's transactions, so two nodes that
//! committed the same block sequence report the same digest. A failure mode
//! can be armed to exercise the "commit error still signs the block" path.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::SUBMIT_CHANNEL_CAPACITY;
use crate::consensus::Block;

use super::{AppProxy, ProxyError};

/// In-memory [`AppProxy`]. One instance per node.
pub struct InmemAppProxy {
    submit_tx: mpsc::Sender<Vec<u8>>,
    submit_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    committed: Mutex<Vec<Block>>,
    state_hash: Mutex<Vec<u8>>,
    fail_commits: AtomicBool,
}

impl InmemAppProxy {
    pub fn new() -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_CHANNEL_CAPACITY);
        Self {
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            committed: Mutex::new(Vec::new()),
            state_hash: Mutex::new(Vec::new()),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Submits a transaction payload, as the application would.
    pub async fn submit_transaction(&self, tx: Vec<u8>) -> Result<(), ProxyError> {
        self.submit_tx
            .send(tx)
            .await
            .map_err(|_| ProxyError::SubmitClosed)
    }

    /// All blocks committed so far, in delivery order.
    pub fn committed_blocks(&self) -> Vec<Block> {
        self.committed.lock().clone()
    }

    /// Number of blocks committed so far.
    pub fn committed_count(&self) -> usize {
        self.committed.lock().len()
    }

    /// Current state digest.
    pub fn state_hash(&self) -> Vec<u8> {
        self.state_hash.lock().clone()
    }

    /// Arms or disarms commit failures. While armed, `commit_block` rejects
    /// every delivery without recording it.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

impl Default for InmemAppProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl AppProxy for InmemAppProxy {
    fn submit_ch(&self) -> mpsc::Receiver<Vec<u8>> {
        match self.submit_rx.lock().take() {
            Some(rx) => rx,
            None => {
                debug!("submit channel taken twice");
                mpsc::channel(1).1
            }
        }
    }

    async fn commit_block(&self, block: Block) -> Result<Vec<u8>, ProxyError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(ProxyError::AppUnavailable("commit failure armed".into()));
        }

        let mut state = self.state_hash.lock();
        let mut hasher = Sha256::new();
        hasher.update(&*state);
        for tx in block.transactions() {
            hasher.update((tx.len() as u64).to_be_bytes());
            hasher.update(tx);
        }
        *state = hasher.finalize().to_vec();
        let digest = state.clone();
        drop(state);

        debug!(
            block = block.index(),
            txs = block.transactions().len(),
            "block committed to application"
        );
        self.committed.lock().push(block);
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_surfaces_on_the_channel() {
        let proxy = InmemAppProxy::new();
        let mut rx = proxy.submit_ch();
        proxy.submit_transaction(b"tx".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"tx".to_vec());
    }

    #[tokio::test]
    async fn commit_chains_the_state_hash() {
        let proxy = InmemAppProxy::new();
        let h1 = proxy
            .commit_block(Block::new(0, 0, vec![b"a".to_vec()]))
            .await
            .unwrap();
        let h2 = proxy
            .commit_block(Block::new(1, 1, vec![b"b".to_vec()]))
            .await
            .unwrap();
        assert_ne!(h1, h2);
        assert_eq!(proxy.committed_count(), 2);
        assert_eq!(proxy.state_hash(), h2);

        // Same block sequence, same digest — replayed on a fresh proxy.
        let replay = InmemAppProxy::new();
        replay
            .commit_block(Block::new(0, 0, vec![b"a".to_vec()]))
            .await
            .unwrap();
        let replayed = replay
            .commit_block(Block::new(1, 1, vec![b"b".to_vec()]))
            .await
            .unwrap();
        assert_eq!(replayed, h2);
    }

    #[tokio::test]
    async fn armed_failure_rejects_commits() {
        let proxy = InmemAppProxy::new();
        proxy.set_fail_commits(true);
        let err = proxy
            .commit_block(Block::new(0, 0, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::AppUnavailable(_)));
        assert_eq!(proxy.committed_count(), 0);

        proxy.set_fail_commits(false);
        assert!(proxy.commit_block(Block::new(0, 0, vec![])).await.is_ok());
    }
}
