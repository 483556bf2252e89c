//! Core data model: execution/assertion state and the node-action sum type.
//!
//! Mirrors `core.ExecutionState` / `core.NodeState` / `core.Assertion` /
//! `nodeAction` from the original validator, narrowed from Go's `*big.Int`
//! counters to `u64` (see DESIGN.md).

use alloy_primitives::{B256, keccak256};
use serde::{Deserialize, Serialize};

/// Opaque 32-byte node identifier (`NodeHash` in spec.md §3).
pub type NodeHash = B256;

/// The VM's logical position: gas consumed and the accumulators derived
/// from it. Monotone non-decreasing across the chain of assertions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub total_gas_consumed: u64,
    pub machine_hash: B256,
    pub total_messages_read: u64,
    pub total_send_count: u64,
    pub total_log_count: u64,
}

impl ExecutionState {
    /// Digest used as the "execution hash" input to chunk hashing.
    pub fn hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(32 + 8 * 3);
        buf.extend_from_slice(self.machine_hash.as_slice());
        buf.extend_from_slice(&self.total_gas_consumed.to_be_bytes());
        buf.extend_from_slice(&self.total_messages_read.to_be_bytes());
        buf.extend_from_slice(&self.total_send_count.to_be_bytes());
        buf.extend_from_slice(&self.total_log_count.to_be_bytes());
        keccak256(buf)
    }
}

/// `ExecutionState` plus the block height at which the node was proposed
/// and the inbox-message-count snapshot observed at proposal time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub execution: ExecutionState,
    pub proposed_block: u64,
    pub inbox_max_count: u64,
}

impl NodeState {
    /// Synthesizes the genesis node's state from the rollup-creation event:
    /// gas/messages/sends/logs all zero, machine hash from the event,
    /// inbox-max-count = 1.
    pub fn genesis(proposed_block: u64, machine_hash: B256) -> Self {
        Self {
            execution: ExecutionState {
                total_gas_consumed: 0,
                machine_hash,
                total_messages_read: 0,
                total_send_count: 0,
                total_log_count: 0,
            },
            proposed_block,
            inbox_max_count: 1,
        }
    }
}

/// Before/after execution states plus the inbox accumulator observed at
/// the after-state, derived from stepping the local machine to a gas stop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub before: ExecutionState,
    pub after: ExecutionState,
    pub after_inbox_acc: B256,
}

impl ExecutionInfo {
    pub fn gas_used(&self) -> u64 {
        self.after.total_gas_consumed - self.before.total_gas_consumed
    }

    pub fn inbox_messages_read(&self) -> u64 {
        self.after.total_messages_read - self.before.total_messages_read
    }

    pub fn log_count(&self) -> u64 {
        self.after.total_log_count - self.before.total_log_count
    }

    pub fn send_count(&self) -> u64 {
        self.after.total_send_count - self.before.total_send_count
    }
}

/// A claim of progress from a "before" `ExecutionState` to an "after"
/// `ExecutionState`, carrying the prior node's block/inbox snapshot.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Assertion {
    pub prev_proposed_block: u64,
    pub prev_inbox_max_count: u64,
    pub execution_info: ExecutionInfo,
}

impl Assertion {
    pub fn before_execution_hash(&self) -> B256 {
        self.execution_info.before.hash()
    }

    pub fn after_execution_hash(&self) -> B256 {
        self.execution_info.after.hash()
    }

    /// `core.BisectionChunkHash(0, gasUsed, beforeExecutionHash, afterExecutionHash)`.
    pub fn hash(&self) -> B256 {
        chunk_hash(
            0,
            self.execution_info.gas_used(),
            self.before_execution_hash(),
            self.after_execution_hash(),
        )
    }
}

/// `core.BisectionChunkHash` — the whole-assertion digest for a single,
/// unbisected segment (`segments = 0`).
pub fn chunk_hash(segments: u64, gas_used: u64, before_hash: B256, after_hash: B256) -> B256 {
    let mut buf = Vec::with_capacity(8 + 8 + 32 + 32);
    buf.extend_from_slice(&segments.to_be_bytes());
    buf.extend_from_slice(&gas_used.to_be_bytes());
    buf.extend_from_slice(before_hash.as_slice());
    buf.extend_from_slice(after_hash.as_slice());
    keccak256(buf)
}

/// New-node hash: digest of `(hasSiblingByte, predecessorOrLastSiblingHash,
/// executionHash, afterInboxAcc)`.
pub fn new_node_hash(
    has_sibling: bool,
    predecessor_or_last_sibling: NodeHash,
    execution_hash: B256,
    after_inbox_acc: B256,
) -> NodeHash {
    let mut buf = Vec::with_capacity(1 + 32 + 32 + 32);
    buf.push(if has_sibling { 1 } else { 0 });
    buf.extend_from_slice(predecessor_or_last_sibling.as_slice());
    buf.extend_from_slice(execution_hash.as_slice());
    buf.extend_from_slice(after_inbox_acc.as_slice());
    keccak256(buf)
}

/// Outcome of `Validator::generate_node_action`.
#[derive(Clone, Debug)]
pub enum NodeAction {
    /// Local execution matches an on-chain child: stake on it.
    ConfirmExisting { node_id: u64, node_hash: NodeHash },
    /// No on-chain child matches; propose one.
    CreateNew {
        assertion: Box<Assertion>,
        new_node_hash: NodeHash,
    },
    /// Do nothing this tick.
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_hash_is_deterministic_and_order_sensitive() {
        let a = chunk_hash(0, 10, B256::repeat_byte(1), B256::repeat_byte(2));
        let b = chunk_hash(0, 10, B256::repeat_byte(1), B256::repeat_byte(2));
        let c = chunk_hash(0, 11, B256::repeat_byte(1), B256::repeat_byte(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn new_node_hash_depends_on_sibling_byte() {
        let pred = B256::repeat_byte(3);
        let exec_hash = B256::repeat_byte(4);
        let inbox_acc = B256::repeat_byte(5);
        let with_sibling = new_node_hash(true, pred, exec_hash, inbox_acc);
        let without_sibling = new_node_hash(false, pred, exec_hash, inbox_acc);
        assert_ne!(with_sibling, without_sibling);
    }

    #[test]
    fn genesis_node_state_matches_spec() {
        let machine_hash = B256::repeat_byte(7);
        let genesis = NodeState::genesis(42, machine_hash);
        assert_eq!(genesis.proposed_block, 42);
        assert_eq!(genesis.inbox_max_count, 1);
        assert_eq!(genesis.execution.total_gas_consumed, 0);
        assert_eq!(genesis.execution.machine_hash, machine_hash);
    }
}
