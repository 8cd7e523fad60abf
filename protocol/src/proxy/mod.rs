//! # Application Interface
//!
//! The contract between the node and the application it orders transactions
//! for. Traffic flows both ways:
//!
//! - the application **submits** raw transaction payloads, which surface on
//!   the submit channel and are appended to the core's pending pool;
//! - the node **commits** totally-ordered blocks back to the application,
//!   which executes them and replies with its post-execution state digest.
//!
//! The commit call is awaited *outside* the node's core lock — the
//! application is an external process and its latency must not serialize
//! with DAG progress.

pub mod inmem;

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::consensus::Block;

/// Failures at the application boundary.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The application could not be reached or rejected the block.
    #[error("application unavailable: {0}")]
    AppUnavailable(String),

    /// The submit channel is gone; the node is no longer accepting
    /// transactions.
    #[error("submit channel closed")]
    SubmitClosed,
}

/// The application proxy consumed by the node runtime.
pub trait AppProxy: Send + Sync + 'static {
    /// Takes the transaction intake stream. Single consumer: the first call
    /// returns the live channel, subsequent calls return a closed one.
    fn submit_ch(&self) -> mpsc::Receiver<Vec<u8>>;

    /// Delivers an ordered block to the application and resolves with the
    /// application's state digest after executing it.
    fn commit_block(
        &self,
        block: Block,
    ) -> impl Future<Output = Result<Vec<u8>, ProxyError>> + Send;
}

/// The host process usually keeps its own handle on the proxy (to submit
/// transactions, to observe commits), so `Arc<P>` proxies delegate to their
/// inner value.
impl<P: AppProxy> AppProxy for std::sync::Arc<P> {
    fn submit_ch(&self) -> mpsc::Receiver<Vec<u8>> {
        (**self).submit_ch()
    }

    async fn commit_block(&self, block: Block) -> Result<Vec<u8>, ProxyError> {
        (**self).commit_block(block).await
    }
}
