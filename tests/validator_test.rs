use alloy_primitives::{Address, B256};
use rollup_validator::chain::{CreationEvent, InMemoryRollup, NodeInfo};
use rollup_validator::execution::InMemoryArbCore;
use rollup_validator::types::{Assertion, ExecutionInfo, ExecutionState, NodeAction};
use rollup_validator::validator::Validator;

fn genesis_machine_hash() -> B256 {
    B256::repeat_byte(0x42)
}

fn make_rollup(min_assertion_period: u64, gas_speed_limit: u64, block_height: u64) -> InMemoryRollup {
    let creation = CreationEvent {
        block_number: 0,
        machine_hash: genesis_machine_hash(),
    };
    let rollup = InMemoryRollup::new(creation, min_assertion_period, gas_speed_limit);
    rollup.set_block_height(block_height);
    rollup
}

fn make_core_with_genesis() -> InMemoryArbCore {
    let core = InMemoryArbCore::new();
    core.seed(
        0,
        ExecutionState {
            total_gas_consumed: 0,
            machine_hash: genesis_machine_hash(),
            ..Default::default()
        },
        B256::ZERO,
    );
    core
}

// S1 — Genesis, inactive validator: no children, active = false => (None, false).
#[tokio::test]
async fn s1_genesis_inactive_returns_none() {
    let rollup = make_rollup(0, 10, 100);
    let validator_utils = make_rollup(0, 10, 100);
    let core = make_core_with_genesis();

    let validator = Validator::new(rollup, validator_utils, core, Address::ZERO);
    let (action, wrong) = validator.generate_node_action(false, false).await.unwrap();
    assert!(matches!(action, NodeAction::None));
    assert!(!wrong);
}

// Invariant 4 / S2 — too-soon assertion returns None regardless of active/proactive.
#[tokio::test]
async fn s2_too_soon_returns_none() {
    let rollup = make_rollup(10, 10, 5); // timeSinceProposed = 5 < minAssertionPeriod = 10
    let validator_utils = make_rollup(10, 10, 5);
    let core = make_core_with_genesis();

    let validator = Validator::new(rollup, validator_utils, core, Address::ZERO);
    let (action, wrong) = validator.generate_node_action(true, true).await.unwrap();
    assert!(matches!(action, NodeAction::None));
    assert!(!wrong);
}

// S3 — a matching existing child wins confirmation.
#[tokio::test]
async fn s3_matching_child_confirms_existing() {
    let rollup = make_rollup(0, 10, 100);
    let core = make_core_with_genesis();

    let child_after = ExecutionState {
        total_gas_consumed: 800,
        machine_hash: B256::repeat_byte(0x77),
        ..Default::default()
    };
    let child_inbox_acc = B256::repeat_byte(0xCC);
    core.seed(800, child_after, child_inbox_acc);

    let child_hash = B256::repeat_byte(0x01);
    rollup.insert_child(
        B256::ZERO,
        NodeInfo {
            node_num: 1,
            node_hash: child_hash,
            assertion: Assertion {
                prev_proposed_block: 0,
                prev_inbox_max_count: 1,
                execution_info: ExecutionInfo {
                    before: ExecutionState {
                        machine_hash: genesis_machine_hash(),
                        ..Default::default()
                    },
                    after: child_after,
                    after_inbox_acc: child_inbox_acc,
                },
            },
            after_inbox_acc: child_inbox_acc,
            proposed_block: 1,
            inbox_max_count: 1,
        },
    );

    let validator_utils = make_rollup(0, 10, 100);
    let validator = Validator::new(rollup, validator_utils, core, Address::ZERO);
    let (action, wrong) = validator.generate_node_action(true, true).await.unwrap();
    match action {
        NodeAction::ConfirmExisting { node_id, node_hash } => {
            assert_eq!(node_id, 1);
            assert_eq!(node_hash, child_hash);
        }
        other => panic!("expected ConfirmExisting, got {other:?}"),
    }
    assert!(!wrong);
}

// S4 — a wrong existing child (inbox-acc mismatch) with proactive new-node creation.
#[tokio::test]
async fn s4_wrong_child_proactive_creates_new_node() {
    // timeSinceProposed=10, gasSpeedLimit=100 => minimumGasToConsume=1000, maximumGasToConsume=4000
    let rollup = make_rollup(0, 100, 10);
    let core = make_core_with_genesis();

    let claimed_after = ExecutionState {
        total_gas_consumed: 1500,
        machine_hash: B256::repeat_byte(0x55),
        ..Default::default()
    };
    let claimed_inbox_acc = B256::repeat_byte(0xAA);
    // Actual after-inbox-acc differs from the child's claim -- execution
    // state matches, but the inbox accumulator doesn't.
    core.seed(1500, claimed_after, B256::repeat_byte(0xBB));

    let child_hash = B256::repeat_byte(0x02);
    rollup.insert_child(
        B256::ZERO,
        NodeInfo {
            node_num: 1,
            node_hash: child_hash,
            assertion: Assertion {
                prev_proposed_block: 0,
                prev_inbox_max_count: 1,
                execution_info: ExecutionInfo {
                    before: ExecutionState {
                        machine_hash: genesis_machine_hash(),
                        ..Default::default()
                    },
                    after: claimed_after,
                    after_inbox_acc: claimed_inbox_acc,
                },
            },
            after_inbox_acc: claimed_inbox_acc,
            proposed_block: 1,
            inbox_max_count: 1,
        },
    );

    // Progress at maximumGasToConsume = 4000: gasUsed = 2000 (>= minimum 1000).
    core.seed(
        4000,
        ExecutionState {
            total_gas_consumed: 2000,
            machine_hash: B256::repeat_byte(0x99),
            ..Default::default()
        },
        B256::repeat_byte(0xDD),
    );

    let validator_utils = make_rollup(0, 100, 10);
    let validator = Validator::new(rollup, validator_utils, core, Address::ZERO);
    let (action, wrong) = validator.generate_node_action(true, true).await.unwrap();
    assert!(wrong, "wrongNodesExist must be true");
    match action {
        NodeAction::CreateNew { assertion, new_node_hash: _ } => {
            assert_eq!(assertion.execution_info.after.total_gas_consumed, 2000);
        }
        other => panic!("expected CreateNew, got {other:?}"),
    }
}

// Invariant 3 — the validator fails the tick rather than proposing past a
// local-machine divergence.
#[tokio::test]
async fn machine_divergence_never_produces_create_new() {
    let rollup = make_rollup(0, 10, 100);
    let validator_utils = make_rollup(0, 10, 100);
    let core = InMemoryArbCore::new();
    core.seed(
        0,
        ExecutionState {
            machine_hash: B256::repeat_byte(0xFF), // does not match genesis_machine_hash()
            ..Default::default()
        },
        B256::ZERO,
    );

    let validator = Validator::new(rollup, validator_utils, core, Address::ZERO);
    let err = validator.generate_node_action(true, true).await.unwrap_err();
    assert!(matches!(err, rollup_validator::validator::ValidatorError::MachineDivergence));
}
