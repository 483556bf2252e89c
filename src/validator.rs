//! Validator Loop: decides each tick whether to stake on an existing
//! on-chain node, propose a new one, or do nothing, plus idempotent
//! housekeeping (spec.md §4.1). Direct transliteration of
//! `original_source/.../staker/validator.go`.

use alloy_primitives::Address;
use log::info;
use thiserror::Error;

use crate::chain::{ChainError, ConfirmType, RollupContract, ValidatorUtils};
use crate::execution::{ArbCoreLookup, ExecutionError};
use crate::types::{Assertion, NodeAction, NodeHash, NodeState};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("local machine doesn't match chain")]
    MachineDivergence,
    #[error("looked up starting node but found wrong hash")]
    StartStateHashMismatch,
}

pub struct Validator<R, U, L> {
    rollup: R,
    validator_utils: U,
    lookup: L,
    address: Address,
}

impl<R, U, L> Validator<R, U, L>
where
    R: RollupContract,
    U: ValidatorUtils,
    L: ArbCoreLookup,
{
    pub fn new(rollup: R, validator_utils: U, lookup: L, address: Address) -> Self {
        Self {
            rollup,
            validator_utils,
            lookup,
            address,
        }
    }

    /// `removeOldStakers`.
    pub async fn remove_old_stakers(&self) -> Result<(), ValidatorError> {
        let stakers = self.validator_utils.refundable_stakers().await?;
        if stakers.is_empty() {
            return Ok(());
        }
        info!("removing {} old stakers", stakers.len());
        self.rollup.return_old_deposits(stakers).await?;
        Ok(())
    }

    /// `resolveTimedOutChallenges`.
    pub async fn resolve_timed_out_challenges(&self) -> Result<(), ValidatorError> {
        let challenges = self.validator_utils.timed_out_challenges(1024).await?;
        if challenges.is_empty() {
            return Ok(());
        }
        info!("timing out {} challenges", challenges.len());
        self.rollup.timeout_challenges(challenges).await?;
        Ok(())
    }

    /// `resolveNextNode`.
    pub async fn resolve_next_node(&self) -> Result<(), ValidatorError> {
        let (confirm_type, successor, staker) =
            self.validator_utils.check_decidable_next_node().await?;
        match confirm_type {
            ConfirmType::Invalid => {
                info!("rejecting node");
                self.rollup.reject_next_node(successor, staker).await?;
            }
            ConfirmType::Valid => {
                let unresolved = self.rollup.first_unresolved_node().await?;
                let node = self.rollup.lookup_node(unresolved).await?;
                let log_acc = self
                    .lookup
                    .get_log_acc(
                        NodeHash::ZERO,
                        node.assertion.execution_info.before.total_log_count,
                        node.assertion.execution_info.log_count(),
                    )
                    .await?;
                let sends = self
                    .lookup
                    .get_sends(
                        node.assertion.execution_info.before.total_send_count,
                        node.assertion.execution_info.send_count(),
                    )
                    .await?;
                info!("confirming node {}", unresolved);
                self.rollup.confirm_next_node(log_acc, sends).await?;
            }
            ConfirmType::None => {}
        }
        Ok(())
    }

    /// `lookupNodeStartState`: the synthesized genesis `NodeState` for
    /// node 0, else the on-chain node's after-state, with a hash check
    /// against the expected base hash.
    async fn lookup_node_start_state(
        &self,
        node_num: u64,
        node_hash: NodeHash,
    ) -> Result<NodeState, ValidatorError> {
        if node_num == 0 {
            let creation = self.rollup.lookup_creation().await?;
            return Ok(NodeState::genesis(creation.block_number, creation.machine_hash));
        }
        let node = self.rollup.lookup_node(node_num).await?;
        if node.node_hash != node_hash {
            return Err(ValidatorError::StartStateHashMismatch);
        }
        Ok(node.after_state())
    }

    /// Runs housekeeping plus the main decision algorithm; callers invoke
    /// this on a periodic cadence.
    pub async fn advance(
        &self,
        active: bool,
        proactive_new_nodes: bool,
    ) -> Result<(), ValidatorError> {
        self.remove_old_stakers().await?;
        self.resolve_timed_out_challenges().await?;
        self.resolve_next_node().await?;

        let (action, wrong_nodes_exist) = self
            .generate_node_action(active, proactive_new_nodes)
            .await?;
        match action {
            NodeAction::ConfirmExisting { node_id, node_hash } => {
                info!("staking on existing node {} ({:?})", node_id, node_hash);
            }
            NodeAction::CreateNew {
                assertion,
                new_node_hash,
            } => {
                info!("proposing new node {:?}", new_node_hash);
                self.rollup
                    .create_new_node(*assertion, new_node_hash)
                    .await?;
            }
            NodeAction::None => {
                if wrong_nodes_exist {
                    info!("wrong nodes exist on chain, no correction proposed this tick");
                }
            }
        }
        Ok(())
    }

    /// `generateNodeAction`: steps 1-11 of the main decision algorithm.
    pub async fn generate_node_action(
        &self,
        active: bool,
        proactive_new_nodes: bool,
    ) -> Result<(NodeAction, bool), ValidatorError> {
        let (base, base_hash) = self.validator_utils.latest_staked(self.address).await?;
        let start_state = self.lookup_node_start_state(base, base_hash).await?;

        let cursor = self
            .lookup
            .get_execution_cursor(start_state.execution.total_gas_consumed)
            .await?;
        if cursor.machine_hash() != start_state.execution.machine_hash {
            return Err(ValidatorError::MachineDivergence);
        }

        let successor_nodes = self.rollup.lookup_node_children(base_hash).await?;

        let current_block = self.rollup.current_block_height().await?;
        let min_assertion_period = self.rollup.minimum_assertion_period().await?;
        let time_since_proposed = current_block.saturating_sub(start_state.proposed_block);
        if time_since_proposed < min_assertion_period {
            return Ok((NodeAction::None, false));
        }

        let arb_gas_speed_limit_per_block = self.rollup.arb_gas_speed_limit_per_block().await?;
        let min_messages = start_state
            .inbox_max_count
            .saturating_sub(start_state.execution.total_messages_read);
        let minimum_gas_to_consume = time_since_proposed * arb_gas_speed_limit_per_block;
        let maximum_gas_to_consume = minimum_gas_to_consume * 4;

        let mut tracker = crate::execution::ExecutionTracker::new(cursor, start_state.execution);

        let mut correct_node: Option<NodeAction> = None;
        let mut wrong_nodes_exist = false;
        for node in &successor_nodes {
            if correct_node.is_some() && wrong_nodes_exist {
                break;
            }
            if correct_node.is_none() {
                let valid = is_assertion_valid(&node.assertion, &mut tracker, node.after_inbox_acc)?;
                if valid {
                    correct_node = Some(NodeAction::ConfirmExisting {
                        node_id: node.node_num,
                        node_hash: node.node_hash,
                    });
                    continue;
                }
            }
            wrong_nodes_exist = true;
        }

        if !active {
            return Ok((correct_node.unwrap_or(NodeAction::None), wrong_nodes_exist));
        }
        if let Some(action) = correct_node {
            return Ok((action, wrong_nodes_exist));
        }
        if !proactive_new_nodes && !wrong_nodes_exist {
            return Ok((NodeAction::None, wrong_nodes_exist));
        }

        let exec_info = tracker.get_execution_info(maximum_gas_to_consume)?;
        if exec_info.gas_used() < minimum_gas_to_consume && exec_info.inbox_messages_read() < min_messages {
            return Ok((NodeAction::None, wrong_nodes_exist));
        }

        let has_sibling = !successor_nodes.is_empty();
        let last_hash = if has_sibling {
            successor_nodes.last().unwrap().node_hash
        } else {
            base_hash
        };
        let assertion = Assertion {
            prev_proposed_block: start_state.proposed_block,
            prev_inbox_max_count: start_state.inbox_max_count,
            execution_info: exec_info,
        };
        let execution_hash = assertion.hash();
        let new_node_hash = crate::types::new_node_hash(
            has_sibling,
            last_hash,
            execution_hash,
            exec_info.after_inbox_acc,
        );
        Ok((
            NodeAction::CreateNew {
                assertion: Box::new(assertion),
                new_node_hash,
            },
            wrong_nodes_exist,
        ))
    }
}

fn is_assertion_valid(
    assertion: &Assertion,
    tracker: &mut crate::execution::ExecutionTracker,
    after_inbox_acc: NodeHash,
) -> Result<bool, ExecutionError> {
    let info = tracker.get_execution_info(assertion.execution_info.after.total_gas_consumed)?;
    Ok(info.after == assertion.execution_info.after && info.after_inbox_acc == after_inbox_acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{CreationEvent, InMemoryRollup};
    use crate::execution::InMemoryArbCore;
    use crate::types::ExecutionState;
    use alloy_primitives::B256;

    fn genesis_machine_hash() -> B256 {
        B256::repeat_byte(9)
    }

    #[tokio::test]
    async fn too_soon_to_assert_returns_none() {
        let creation = CreationEvent {
            block_number: 100,
            machine_hash: genesis_machine_hash(),
        };
        let rollup = InMemoryRollup::new(creation, /*min_assertion_period=*/ 50, /*gas_speed_limit=*/ 10);
        rollup.set_block_height(110); // time_since_proposed = 10 < 50
        let core = InMemoryArbCore::new();
        core.seed(0, ExecutionState { machine_hash: genesis_machine_hash(), ..Default::default() }, B256::ZERO);

        let validator = Validator::new(rollup, InMemoryRollup::new(creation, 50, 10), core, Address::ZERO);
        let (action, wrong) = validator.generate_node_action(true, true).await.unwrap();
        assert!(matches!(action, NodeAction::None));
        assert!(!wrong);
    }

    #[tokio::test]
    async fn machine_divergence_is_fatal() {
        let creation = CreationEvent {
            block_number: 0,
            machine_hash: genesis_machine_hash(),
        };
        let rollup = InMemoryRollup::new(creation, 0, 10);
        rollup.set_block_height(1000);
        let core = InMemoryArbCore::new();
        // seed a mismatched machine hash at gas 0
        core.seed(0, ExecutionState { machine_hash: B256::repeat_byte(0xAA), ..Default::default() }, B256::ZERO);

        let validator = Validator::new(rollup, InMemoryRollup::new(creation, 0, 10), core, Address::ZERO);
        let err = validator.generate_node_action(true, true).await.unwrap_err();
        assert!(matches!(err, ValidatorError::MachineDivergence));
    }
}
