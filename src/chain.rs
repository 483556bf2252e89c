//! `RollupContract` / `ValidatorUtils` / `BridgeWatcher` contracts.
//!
//! These are out-of-scope external collaborators per spec.md §1 — we
//! specify only the traits by which the core consumes them, plus one
//! in-memory fake each for tests, mirroring `hadv-Ockham`'s
//! `storage::Storage` trait / `storage::MemStorage` split.

use std::collections::HashMap;
use std::sync::Mutex;

use alloy_primitives::Address;
use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Assertion, NodeHash};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain query failed: {0}")]
    Query(String),
    #[error("looked up starting node but found wrong hash")]
    HashMismatch,
    #[error("node {0} not found")]
    NodeNotFound(u64),
}

/// Result of `ValidatorUtils::check_decidable_next_node`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmType {
    Invalid,
    Valid,
    None,
}

/// One rollup node as returned by `lookup_node`/`lookup_node_children`.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub node_num: u64,
    pub node_hash: NodeHash,
    pub assertion: Assertion,
    pub after_inbox_acc: NodeHash,
    /// Block height at which this node itself was proposed.
    pub proposed_block: u64,
    /// Inbox-message-count ceiling this node was proposed against.
    pub inbox_max_count: u64,
}

impl NodeInfo {
    /// The `NodeState` a validator bases further assertions on once staked
    /// on this node (`node.AfterState()` in the original).
    pub fn after_state(&self) -> crate::types::NodeState {
        crate::types::NodeState {
            execution: self.assertion.execution_info.after,
            proposed_block: self.proposed_block,
            inbox_max_count: self.inbox_max_count,
        }
    }
}

/// The rollup-creation event recovered at genesis.
#[derive(Clone, Copy, Debug)]
pub struct CreationEvent {
    pub block_number: u64,
    pub machine_hash: alloy_primitives::B256,
}

/// On-chain rollup assertion-tree adapter (spec.md §6 `RollupContract`).
#[async_trait]
pub trait RollupContract: Send + Sync {
    async fn bridge(&self) -> Result<Address, ChainError>;
    async fn first_unresolved_node(&self) -> Result<u64, ChainError>;
    async fn lookup_node(&self, node_num: u64) -> Result<NodeInfo, ChainError>;
    async fn lookup_node_children(&self, parent_hash: NodeHash) -> Result<Vec<NodeInfo>, ChainError>;
    async fn lookup_creation(&self) -> Result<CreationEvent, ChainError>;
    async fn minimum_assertion_period(&self) -> Result<u64, ChainError>;
    async fn arb_gas_speed_limit_per_block(&self) -> Result<u64, ChainError>;
    async fn current_block_height(&self) -> Result<u64, ChainError>;

    async fn reject_next_node(&self, successor: u64, staker: Address) -> Result<(), ChainError>;
    async fn confirm_next_node(
        &self,
        log_acc: NodeHash,
        sends: Vec<u8>,
    ) -> Result<(), ChainError>;
    async fn return_old_deposits(&self, stakers: Vec<Address>) -> Result<(), ChainError>;
    async fn timeout_challenges(&self, ids: Vec<u64>) -> Result<(), ChainError>;
    async fn create_new_node(
        &self,
        assertion: Assertion,
        expected_hash: NodeHash,
    ) -> Result<(), ChainError>;
}

/// `ValidatorUtils` batch-query helper (spec.md §6).
#[async_trait]
pub trait ValidatorUtils: Send + Sync {
    async fn refundable_stakers(&self) -> Result<Vec<Address>, ChainError>;
    async fn timed_out_challenges(&self, limit: usize) -> Result<Vec<u64>, ChainError>;
    async fn latest_staked(&self, address: Address) -> Result<(u64, NodeHash), ChainError>;
    async fn check_decidable_next_node(
        &self,
    ) -> Result<(ConfirmType, u64, Address), ChainError>;
}

/// In-memory fake rollup, for tests.
#[derive(Default)]
pub struct InMemoryRollup {
    inner: Mutex<InMemoryRollupState>,
}

#[derive(Default)]
struct InMemoryRollupState {
    nodes: HashMap<u64, NodeInfo>,
    children_of: HashMap<NodeHash, Vec<u64>>,
    creation: Option<CreationEvent>,
    min_assertion_period: u64,
    gas_speed_limit: u64,
    block_height: u64,
    refundable_stakers: Vec<Address>,
    timed_out_challenges: Vec<u64>,
    decidable: (ConfirmType, u64, Address),
}

impl InMemoryRollup {
    pub fn new(creation: CreationEvent, min_assertion_period: u64, gas_speed_limit: u64) -> Self {
        Self {
            inner: Mutex::new(InMemoryRollupState {
                nodes: HashMap::new(),
                children_of: HashMap::new(),
                creation: Some(creation),
                min_assertion_period,
                gas_speed_limit,
                block_height: creation.block_number,
                refundable_stakers: Vec::new(),
                timed_out_challenges: Vec::new(),
                decidable: (ConfirmType::None, 0, Address::ZERO),
            }),
        }
    }

    pub fn set_block_height(&self, height: u64) {
        self.inner.lock().unwrap().block_height = height;
    }

    pub fn insert_child(&self, parent_hash: NodeHash, node: NodeInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .children_of
            .entry(parent_hash)
            .or_default()
            .push(node.node_num);
        inner.nodes.insert(node.node_num, node);
    }

    pub fn set_refundable_stakers(&self, stakers: Vec<Address>) {
        self.inner.lock().unwrap().refundable_stakers = stakers;
    }

    pub fn set_timed_out_challenges(&self, ids: Vec<u64>) {
        self.inner.lock().unwrap().timed_out_challenges = ids;
    }

    pub fn set_decidable(&self, decidable: (ConfirmType, u64, Address)) {
        self.inner.lock().unwrap().decidable = decidable;
    }
}

#[async_trait]
impl RollupContract for InMemoryRollup {
    async fn bridge(&self) -> Result<Address, ChainError> {
        Ok(Address::ZERO)
    }

    async fn first_unresolved_node(&self) -> Result<u64, ChainError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.nodes.keys().min().copied().unwrap_or(0))
    }

    async fn lookup_node(&self, node_num: u64) -> Result<NodeInfo, ChainError> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(&node_num)
            .cloned()
            .ok_or(ChainError::NodeNotFound(node_num))
    }

    async fn lookup_node_children(&self, parent_hash: NodeHash) -> Result<Vec<NodeInfo>, ChainError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .children_of
            .get(&parent_hash)
            .map(|nums| nums.iter().filter_map(|n| inner.nodes.get(n).cloned()).collect())
            .unwrap_or_default())
    }

    async fn lookup_creation(&self) -> Result<CreationEvent, ChainError> {
        self.inner
            .lock()
            .unwrap()
            .creation
            .ok_or_else(|| ChainError::Query("no creation event".into()))
    }

    async fn minimum_assertion_period(&self) -> Result<u64, ChainError> {
        Ok(self.inner.lock().unwrap().min_assertion_period)
    }

    async fn arb_gas_speed_limit_per_block(&self) -> Result<u64, ChainError> {
        Ok(self.inner.lock().unwrap().gas_speed_limit)
    }

    async fn current_block_height(&self) -> Result<u64, ChainError> {
        Ok(self.inner.lock().unwrap().block_height)
    }

    async fn reject_next_node(&self, _successor: u64, _staker: Address) -> Result<(), ChainError> {
        Ok(())
    }

    async fn confirm_next_node(&self, _log_acc: NodeHash, _sends: Vec<u8>) -> Result<(), ChainError> {
        Ok(())
    }

    async fn return_old_deposits(&self, _stakers: Vec<Address>) -> Result<(), ChainError> {
        Ok(())
    }

    async fn timeout_challenges(&self, _ids: Vec<u64>) -> Result<(), ChainError> {
        Ok(())
    }

    async fn create_new_node(
        &self,
        assertion: Assertion,
        expected_hash: NodeHash,
    ) -> Result<(), ChainError> {
        let mut inner = self.inner.lock().unwrap();
        let node_num = inner.nodes.len() as u64 + 1;
        let after_inbox_acc = assertion.execution_info.after_inbox_acc;
        let proposed_block = inner.block_height;
        let inbox_max_count =
            assertion.prev_inbox_max_count.max(assertion.execution_info.after.total_messages_read);
        inner.nodes.insert(
            node_num,
            NodeInfo {
                node_num,
                node_hash: expected_hash,
                assertion,
                after_inbox_acc,
                proposed_block,
                inbox_max_count,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ValidatorUtils for InMemoryRollup {
    async fn refundable_stakers(&self) -> Result<Vec<Address>, ChainError> {
        Ok(self.inner.lock().unwrap().refundable_stakers.clone())
    }

    async fn timed_out_challenges(&self, limit: usize) -> Result<Vec<u64>, ChainError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.timed_out_challenges.iter().take(limit).copied().collect())
    }

    async fn latest_staked(&self, _address: Address) -> Result<(u64, NodeHash), ChainError> {
        Ok((0, NodeHash::ZERO))
    }

    async fn check_decidable_next_node(&self) -> Result<(ConfirmType, u64, Address), ChainError> {
        Ok(self.inner.lock().unwrap().decidable)
    }
}
