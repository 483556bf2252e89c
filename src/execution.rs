//! Execution Adapter: wraps the local VM cursor and gas-indexed stepping,
//! answering "is this on-chain assertion consistent with what my machine
//! computes?" (spec.md §4.2).
//!
//! `ArbCoreLookup` is the out-of-scope local-core collaborator (spec.md
//! §1/§6); only its trait contract and an in-memory test fake live here,
//! mirroring the teacher's `Executor` (`hadv-Ockham/src/vm.rs`) generalized
//! from "step an EVM" to "step an abstract gas-indexed machine".

use std::collections::BTreeMap;
use std::sync::Mutex;

use alloy_primitives::B256;
use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Assertion, ExecutionInfo, ExecutionState};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("local core query failed: {0}")]
    Query(String),
    #[error("no execution data for gas stop {0}")]
    UnknownStop(u64),
    #[error("tracker cannot rewind: requested stop {requested} is behind reached gas {reached}")]
    Rewound { requested: u64, reached: u64 },
}

/// A handle into the local VM positioned at a specific cumulative gas,
/// from which forward stepping is possible.
pub trait ExecutionCursor: Send {
    fn machine_hash(&self) -> B256;

    /// Steps the cursor forward so total gas consumed == `target_gas`.
    /// `target_gas` must be >= the cursor's current position.
    fn advance_to(&mut self, target_gas: u64) -> Result<(ExecutionState, B256), ExecutionError>;
}

/// Local core contract (`core.ArbCoreLookup` in the original).
#[async_trait]
pub trait ArbCoreLookup: Send + Sync {
    async fn get_execution_cursor(
        &self,
        gas: u64,
    ) -> Result<Box<dyn ExecutionCursor>, ExecutionError>;
    async fn get_log_acc(
        &self,
        pre_hash: B256,
        pre_log_count: u64,
        log_count: u64,
    ) -> Result<B256, ExecutionError>;
    async fn get_sends(&self, pre_send_count: u64, send_count: u64) -> Result<Vec<u8>, ExecutionError>;
    async fn get_message_count(&self) -> Result<u64, ExecutionError>;
}

#[async_trait]
impl<T: ArbCoreLookup + ?Sized> ArbCoreLookup for std::sync::Arc<T> {
    async fn get_execution_cursor(
        &self,
        gas: u64,
    ) -> Result<Box<dyn ExecutionCursor>, ExecutionError> {
        (**self).get_execution_cursor(gas).await
    }

    async fn get_log_acc(
        &self,
        pre_hash: B256,
        pre_log_count: u64,
        log_count: u64,
    ) -> Result<B256, ExecutionError> {
        (**self).get_log_acc(pre_hash, pre_log_count, log_count).await
    }

    async fn get_sends(&self, pre_send_count: u64, send_count: u64) -> Result<Vec<u8>, ExecutionError> {
        (**self).get_sends(pre_send_count, send_count).await
    }

    async fn get_message_count(&self) -> Result<u64, ExecutionError> {
        (**self).get_message_count().await
    }
}

/// A finite, non-restartable lazy walk over gas stops (spec.md §9 design
/// note): stops must be requested in non-decreasing gas order, mirroring
/// a real VM that can step forward but never rewind.
pub struct ExecutionTracker {
    cursor: Box<dyn ExecutionCursor>,
    current_state: ExecutionState,
    current_inbox_acc: B256,
}

impl ExecutionTracker {
    pub fn new(cursor: Box<dyn ExecutionCursor>, start_state: ExecutionState) -> Self {
        Self {
            cursor,
            current_state: start_state,
            current_inbox_acc: B256::ZERO,
        }
    }

    /// Steps the machine forward to `stop_gas`, returning the
    /// `ExecutionInfo` spanning the previously-reached state and the new
    /// one. Fails if `stop_gas` would rewind past the last state reached.
    pub fn get_execution_info(&mut self, stop_gas: u64) -> Result<ExecutionInfo, ExecutionError> {
        if stop_gas < self.current_state.total_gas_consumed {
            return Err(ExecutionError::Rewound {
                requested: stop_gas,
                reached: self.current_state.total_gas_consumed,
            });
        }
        let before = self.current_state;
        let (after, after_inbox_acc) = self.cursor.advance_to(stop_gas)?;
        self.current_state = after;
        self.current_inbox_acc = after_inbox_acc;
        Ok(ExecutionInfo {
            before,
            after,
            after_inbox_acc,
        })
    }
}

/// Wraps `ArbCoreLookup` with the Execution Adapter's public contract
/// (spec.md §4.2).
pub struct ExecutionAdapter<L: ArbCoreLookup + ?Sized> {
    lookup: std::sync::Arc<L>,
}

impl<L: ArbCoreLookup + ?Sized> ExecutionAdapter<L> {
    pub fn new(lookup: std::sync::Arc<L>) -> Self {
        Self { lookup }
    }

    pub async fn get_cursor(&self, gas: u64) -> Result<Box<dyn ExecutionCursor>, ExecutionError> {
        self.lookup.get_execution_cursor(gas).await
    }

    pub fn new_tracker(
        &self,
        cursor: Box<dyn ExecutionCursor>,
        start_state: ExecutionState,
    ) -> ExecutionTracker {
        ExecutionTracker::new(cursor, start_state)
    }

    /// Tracker steps to `assertion.after`; valid iff the tracker's
    /// resulting state and inbox accumulator match the assertion's claim.
    pub fn is_assertion_valid(
        &self,
        assertion: &Assertion,
        tracker: &mut ExecutionTracker,
        after_inbox_acc: B256,
    ) -> Result<bool, ExecutionError> {
        let info = tracker.get_execution_info(assertion.execution_info.after.total_gas_consumed)?;
        Ok(info.after == assertion.execution_info.after && info.after_inbox_acc == after_inbox_acc)
    }

    pub async fn get_log_acc(
        &self,
        pre_hash: B256,
        pre_log_count: u64,
        log_count: u64,
    ) -> Result<B256, ExecutionError> {
        self.lookup.get_log_acc(pre_hash, pre_log_count, log_count).await
    }

    pub async fn get_sends(
        &self,
        pre_send_count: u64,
        send_count: u64,
    ) -> Result<Vec<u8>, ExecutionError> {
        self.lookup.get_sends(pre_send_count, send_count).await
    }

    pub async fn get_message_count(&self) -> Result<u64, ExecutionError> {
        self.lookup.get_message_count().await
    }
}

/// In-memory fake `ArbCoreLookup`, for tests. Callers seed a schedule of
/// `gas -> (ExecutionState, inbox_acc)` the fake cursor will replay.
#[derive(Default)]
pub struct InMemoryArbCore {
    schedule: Mutex<BTreeMap<u64, (ExecutionState, B256)>>,
    message_count: Mutex<u64>,
}

impl InMemoryArbCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, gas: u64, state: ExecutionState, inbox_acc: B256) {
        self.schedule.lock().unwrap().insert(gas, (state, inbox_acc));
    }

    pub fn set_message_count(&self, count: u64) {
        *self.message_count.lock().unwrap() = count;
    }
}

struct InMemoryCursor {
    machine_hash: B256,
    schedule: BTreeMap<u64, (ExecutionState, B256)>,
}

impl ExecutionCursor for InMemoryCursor {
    fn machine_hash(&self) -> B256 {
        self.machine_hash
    }

    fn advance_to(&mut self, target_gas: u64) -> Result<(ExecutionState, B256), ExecutionError> {
        self.schedule
            .get(&target_gas)
            .copied()
            .ok_or(ExecutionError::UnknownStop(target_gas))
    }
}

#[async_trait]
impl ArbCoreLookup for InMemoryArbCore {
    async fn get_execution_cursor(
        &self,
        gas: u64,
    ) -> Result<Box<dyn ExecutionCursor>, ExecutionError> {
        let schedule = self.schedule.lock().unwrap().clone();
        let machine_hash = schedule
            .get(&gas)
            .map(|(state, _)| state.machine_hash)
            .unwrap_or_default();
        Ok(Box::new(InMemoryCursor {
            machine_hash,
            schedule,
        }))
    }

    async fn get_log_acc(
        &self,
        _pre_hash: B256,
        _pre_log_count: u64,
        _log_count: u64,
    ) -> Result<B256, ExecutionError> {
        Ok(B256::ZERO)
    }

    async fn get_sends(&self, _pre_send_count: u64, _send_count: u64) -> Result<Vec<u8>, ExecutionError> {
        Ok(Vec::new())
    }

    async fn get_message_count(&self) -> Result<u64, ExecutionError> {
        Ok(*self.message_count.lock().unwrap())
    }
}
