//! Transaction batcher contract and the three-case handle the Lockout
//! Coordinator installs (spec.md §9: "a three-case variant rather than
//! an open interface hierarchy"). The batcher *implementations*
//! themselves are external collaborators (spec.md §1); this module
//! specifies only the contract plus the thin forwarder/error wrappers
//! and a local fake sufficient for the coordinator to drive and test.
//! Grounded on `original_source/.../rpc/lockout.go`'s `errorBatcher`,
//! `batcher.NewForwarder`, `RPC_URL_PREFIX`/`RPC_URL_POSTFIX`;
//! `hadv-Ockham/src/tx_pool.rs`'s `Arc<Mutex<HashMap<...>>>` shape for
//! the local queue.

use std::collections::VecDeque;
use std::sync::Mutex;

use alloy_primitives::Address;
use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("{0}")]
    Rejected(String),
    #[error("rpc error forwarding to peer: {0}")]
    Forward(#[from] jsonrpsee::core::ClientError),
}

/// A snapshot of currently-pending transactions, opaque to the
/// coordinator (external collaborator; body intentionally minimal).
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub pending: Vec<Vec<u8>>,
}

/// Contract the Lockout Coordinator drives, regardless of which
/// concrete batcher is installed.
#[async_trait]
pub trait TransactionBatcher: Send + Sync {
    async fn send_transaction(&self, tx: Vec<u8>) -> Result<(), BatcherError>;
    fn pending_transaction_count(&self, account: Address) -> Option<u64>;
    fn pending_snapshot(&self) -> Result<Snapshot, BatcherError>;
    fn aggregator(&self) -> Option<Address>;
}

/// Local fake sequencer queue. A production sequencer batcher (ordering,
/// gas accounting, aggregator submission) is the external collaborator
/// this stands in for; this just tracks enough state for the
/// coordinator's handoff/catchup logic to observe a message count.
#[derive(Default)]
pub struct SequencerBatcher {
    queue: Mutex<VecDeque<Vec<u8>>>,
    message_count: Mutex<u64>,
}

impl SequencerBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> u64 {
        *self.message_count.lock().unwrap()
    }
}

#[async_trait]
impl TransactionBatcher for SequencerBatcher {
    async fn send_transaction(&self, tx: Vec<u8>) -> Result<(), BatcherError> {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(tx);
        *self.message_count.lock().unwrap() += 1;
        Ok(())
    }

    fn pending_transaction_count(&self, _account: Address) -> Option<u64> {
        Some(self.queue.lock().unwrap().len() as u64)
    }

    fn pending_snapshot(&self) -> Result<Snapshot, BatcherError> {
        Ok(Snapshot {
            pending: self.queue.lock().unwrap().iter().cloned().collect(),
        })
    }

    fn aggregator(&self) -> Option<Address> {
        None
    }
}

/// Forwards every call to the elected sequencer's RPC endpoint
/// (`RPC_URL_PREFIX<host>RPC_URL_POSTFIX` in the original).
pub struct ForwarderBatcher {
    client: HttpClient,
}

impl ForwarderBatcher {
    pub fn connect(host: &str) -> Result<Self, BatcherError> {
        let url = format!("http://{host}:8545/rpc");
        let client = HttpClientBuilder::default()
            .build(url)
            .map_err(|e| BatcherError::Rejected(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TransactionBatcher for ForwarderBatcher {
    async fn send_transaction(&self, tx: Vec<u8>) -> Result<(), BatcherError> {
        self.client
            .request::<(), _>("sendTransaction", rpc_params![hex::encode(tx)])
            .await?;
        Ok(())
    }

    fn pending_transaction_count(&self, _account: Address) -> Option<u64> {
        None
    }

    fn pending_snapshot(&self) -> Result<Snapshot, BatcherError> {
        Err(BatcherError::Rejected("snapshot unavailable via forwarder".into()))
    }

    fn aggregator(&self) -> Option<Address> {
        None
    }
}

/// Installed whenever the coordinator has nothing safe to route to.
pub struct ErrorBatcher {
    reason: String,
}

impl ErrorBatcher {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl TransactionBatcher for ErrorBatcher {
    async fn send_transaction(&self, _tx: Vec<u8>) -> Result<(), BatcherError> {
        Err(BatcherError::Rejected(self.reason.clone()))
    }

    fn pending_transaction_count(&self, _account: Address) -> Option<u64> {
        None
    }

    fn pending_snapshot(&self) -> Result<Snapshot, BatcherError> {
        Err(BatcherError::Rejected(self.reason.clone()))
    }

    fn aggregator(&self) -> Option<Address> {
        None
    }
}

/// The three-case handle (spec.md §9) the coordinator installs and the
/// facade delegates through.
pub enum TransactionBatcherHandle {
    LocalSequencer(std::sync::Arc<SequencerBatcher>),
    Forwarder(std::sync::Arc<ForwarderBatcher>),
    Error(std::sync::Arc<ErrorBatcher>),
}

impl TransactionBatcherHandle {
    pub fn is_local_sequencer(&self) -> bool {
        matches!(self, TransactionBatcherHandle::LocalSequencer(_))
    }
}

#[async_trait]
impl TransactionBatcher for TransactionBatcherHandle {
    async fn send_transaction(&self, tx: Vec<u8>) -> Result<(), BatcherError> {
        match self {
            Self::LocalSequencer(b) => b.send_transaction(tx).await,
            Self::Forwarder(b) => b.send_transaction(tx).await,
            Self::Error(b) => b.send_transaction(tx).await,
        }
    }

    fn pending_transaction_count(&self, account: Address) -> Option<u64> {
        match self {
            Self::LocalSequencer(b) => b.pending_transaction_count(account),
            Self::Forwarder(b) => b.pending_transaction_count(account),
            Self::Error(b) => b.pending_transaction_count(account),
        }
    }

    fn pending_snapshot(&self) -> Result<Snapshot, BatcherError> {
        match self {
            Self::LocalSequencer(b) => b.pending_snapshot(),
            Self::Forwarder(b) => b.pending_snapshot(),
            Self::Error(b) => b.pending_snapshot(),
        }
    }

    fn aggregator(&self) -> Option<Address> {
        match self {
            Self::LocalSequencer(b) => b.aggregator(),
            Self::Forwarder(b) => b.aggregator(),
            Self::Error(b) => b.aggregator(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequencer_batcher_tracks_message_count() {
        let batcher = SequencerBatcher::new();
        batcher.send_transaction(vec![1, 2, 3]).await.unwrap();
        batcher.send_transaction(vec![4]).await.unwrap();
        assert_eq!(batcher.message_count(), 2);
    }

    #[tokio::test]
    async fn error_batcher_rejects_everything() {
        let batcher = ErrorBatcher::new("shutting down");
        let err = batcher.send_transaction(vec![]).await.unwrap_err();
        assert!(matches!(err, BatcherError::Rejected(reason) if reason == "shutting down"));
    }
}
