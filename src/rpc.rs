//! Thin JSON-RPC surface over the Batcher Facade (spec.md §4.4), in the
//! teacher's `#[rpc(server)]` idiom (`hadv-Ockham/src/rpc.rs`), trimmed
//! to the facade's actual operation set.

use std::sync::Arc;

use alloy_primitives::Address;
use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use crate::coordination::CoordinationStore;
use crate::execution::ArbCoreLookup;
use crate::lockout::LockoutCoordinator;

#[rpc(server)]
pub trait SequencerRpc {
    #[method(name = "sendTransaction")]
    async fn send_transaction(&self, tx: String) -> RpcResult<()>;

    #[method(name = "pendingTransactionCount")]
    async fn pending_transaction_count(&self, account: Address) -> RpcResult<Option<u64>>;

    #[method(name = "shouldSequence")]
    async fn should_sequence(&self) -> RpcResult<bool>;

    #[method(name = "aggregator")]
    async fn aggregator(&self) -> RpcResult<Option<Address>>;
}

pub struct SequencerRpcImpl<S, L> {
    coordinator: Arc<LockoutCoordinator<S, L>>,
}

impl<S, L> SequencerRpcImpl<S, L> {
    pub fn new(coordinator: Arc<LockoutCoordinator<S, L>>) -> Self {
        Self { coordinator }
    }
}

fn batcher_error(e: crate::batcher::BatcherError) -> jsonrpsee::types::ErrorObjectOwned {
    jsonrpsee::types::ErrorObject::owned(-32000, format!("batcher error: {e}"), None::<()>)
}

#[jsonrpsee::core::async_trait]
impl<S, L> SequencerRpcServer for SequencerRpcImpl<S, L>
where
    S: CoordinationStore + 'static,
    L: ArbCoreLookup + 'static,
{
    async fn send_transaction(&self, tx: String) -> RpcResult<()> {
        let bytes = hex::decode(tx.trim_start_matches("0x"))
            .map_err(|e| jsonrpsee::types::ErrorObject::owned(-32602, format!("invalid hex: {e}"), None::<()>))?;
        self.coordinator.send_transaction(bytes).await.map_err(batcher_error)
    }

    async fn pending_transaction_count(&self, account: Address) -> RpcResult<Option<u64>> {
        Ok(self.coordinator.pending_transaction_count(account).await)
    }

    async fn should_sequence(&self) -> RpcResult<bool> {
        Ok(self.coordinator.should_sequence().await)
    }

    async fn aggregator(&self) -> RpcResult<Option<Address>> {
        Ok(self.coordinator.aggregator().await)
    }
}
