use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rollup_validator::chain::{CreationEvent, InMemoryRollup, RollupContract, ValidatorUtils};
use rollup_validator::config::Config;
use rollup_validator::coordination::RedisCoordinationStore;
use rollup_validator::execution::{ArbCoreLookup, InMemoryArbCore};
use rollup_validator::lockout::LockoutCoordinator;
use rollup_validator::rpc::{SequencerRpcImpl, SequencerRpcServer};
use rollup_validator::validator::{Validator, ValidatorError};
use tokio::sync::watch;

/// The Validator Loop's own cadence isn't dictated by spec.md (ticks are
/// "paced by the caller"); polled on roughly an L1 block-time cadence.
const VALIDATOR_POLL_INTERVAL: Duration = Duration::from_secs(12);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = Config::from_env()?;
    info!("starting rollup validator node as {}", config.hostname);

    let store = Arc::new(RedisCoordinationStore::new(&config.redis_url)?);
    let lookup = local_core_lookup();

    let coordinator = Arc::new(LockoutCoordinator::new(
        store,
        lookup.clone(),
        config.hostname.clone(),
        config.liveliness_timeout,
        config.lockout_timeout,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator_loop = tokio::spawn(coordinator.clone().run(shutdown_rx));

    let validator = local_validator(&config, lookup);
    let mut validator_shutdown = shutdown_tx.subscribe();
    let validator_loop = tokio::spawn(async move {
        run_validator_loop(validator, &mut validator_shutdown).await;
    });

    let rpc_module = SequencerRpcImpl::new(coordinator.clone()).into_rpc();
    let server = jsonrpsee::server::ServerBuilder::default()
        .build("0.0.0.0:8545")
        .await?;
    let handle = server.start(rpc_module);

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    handle.stop()?;
    if let Err(e) = coordinator_loop.await {
        error!("coordinator loop panicked: {e}");
    }
    if let Err(e) = validator_loop.await {
        error!("validator loop panicked: {e}");
    }

    Ok(())
}

/// Wires the local ArbCore-style collaborator. Real local-VM access is
/// out of scope (spec.md §1: this crate specifies only the
/// `ArbCoreLookup` contract), so the bootstrap wires the in-memory fake.
fn local_core_lookup() -> Arc<InMemoryArbCore> {
    Arc::new(InMemoryArbCore::new())
}

/// Wires the on-chain rollup contract collaborators. Out of scope per
/// spec.md §1 (`RollupContract`/`ValidatorUtils` are trait contracts
/// only), so the bootstrap wires in-memory fakes here too.
fn local_validator(
    config: &Config,
    lookup: Arc<InMemoryArbCore>,
) -> Validator<InMemoryRollup, InMemoryRollup, Arc<InMemoryArbCore>> {
    let creation = CreationEvent {
        block_number: 0,
        machine_hash: alloy_primitives::B256::ZERO,
    };
    let rollup = InMemoryRollup::new(creation, 0, 0);
    let validator_utils = InMemoryRollup::new(creation, 0, 0);
    Validator::new(rollup, validator_utils, lookup, config.validator_address)
}

/// Paces `Validator::advance` on `VALIDATOR_POLL_INTERVAL` until shutdown.
/// Transient errors are logged and retried next tick; machine divergence
/// is fatal (spec.md §4.1 "must never be swallowed") and exits the
/// process rather than continuing to tick against a diverged machine.
async fn run_validator_loop<R, U, L>(validator: Validator<R, U, L>, shutdown: &mut watch::Receiver<bool>)
where
    R: RollupContract,
    U: ValidatorUtils,
    L: ArbCoreLookup,
{
    let mut interval = tokio::time::interval(VALIDATOR_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                match validator.advance(true, true).await {
                    Ok(()) => {}
                    Err(ValidatorError::MachineDivergence) => {
                        error!("local machine diverged from chain state, exiting");
                        std::process::exit(1);
                    }
                    Err(e) => warn!("validator tick failed, retrying next cadence: {e}"),
                }
            }
        }
    }
}
