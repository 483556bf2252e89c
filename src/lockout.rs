//! Lockout Coordinator: maintains per-host liveliness, runs leader
//! election, acquires/renews the sequencing lease, and swaps the
//! installed batcher between local-sequencing, forwarding, and error
//! (spec.md §4.3). Grounded almost directly on
//! `original_source/.../rpc/lockout.go`'s `lockoutManager`,
//! `ShouldSequence`, `getBatcher`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::time::sleep;

use crate::batcher::{BatcherError, ErrorBatcher, ForwarderBatcher, SequencerBatcher, TransactionBatcher, TransactionBatcherHandle};
use crate::coordination::{CoordinationError, CoordinationStore};
use crate::execution::{ArbCoreLookup, ExecutionError};

/// Fixed per spec.md §9: "a design constant, not configurable".
pub const SAFETY_MARGIN: Duration = Duration::from_secs(10);
const DEFAULT_REFRESH_DELAY: Duration = Duration::from_millis(100);
const CATCHUP_POLL_DELAY: Duration = Duration::from_millis(500);
const CATCHUP_ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Bound on how long `hand_off` holds the exclusive section waiting for a
/// newly-elected peer to actually acquire the lease before giving up for
/// this tick (spec.md §9's bounded-wait alternative to indefinite retention).
const HANDOFF_WAIT_BOUND: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LockoutError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

struct CoordinatorState {
    current_batcher: TransactionBatcherHandle,
    current_seq: Option<String>,
    lockout_expires_at: Option<DateTime<Utc>>,
}

/// Maintains the currently routed batcher and exposes the read-mostly
/// facade (spec.md §4.4).
pub struct LockoutCoordinator<S, L> {
    store: Arc<S>,
    lookup: Arc<L>,
    hostname: String,
    liveliness_timeout: Duration,
    lockout_timeout: Duration,
    sequencer_batcher: Arc<SequencerBatcher>,
    inbox_delivery_lock: AsyncMutex<()>,
    state: RwLock<CoordinatorState>,
}

impl<S, L> LockoutCoordinator<S, L>
where
    S: CoordinationStore,
    L: ArbCoreLookup,
{
    pub fn new(
        store: Arc<S>,
        lookup: Arc<L>,
        hostname: String,
        liveliness_timeout: Duration,
        lockout_timeout: Duration,
    ) -> Self {
        Self {
            store,
            lookup,
            hostname,
            liveliness_timeout,
            lockout_timeout,
            sequencer_batcher: Arc::new(SequencerBatcher::new()),
            inbox_delivery_lock: AsyncMutex::new(()),
            state: RwLock::new(CoordinatorState {
                current_batcher: TransactionBatcherHandle::Error(Arc::new(ErrorBatcher::new(
                    "sequencer lockout manager starting up",
                ))),
                current_seq: None,
                lockout_expires_at: None,
            }),
        }
    }

    /// `ShouldSequence`: elected *and* still inside the lease window minus
    /// the safety margin (the safety margin is already folded into
    /// `lockout_expires_at` when the lease is acquired).
    pub async fn should_sequence(&self) -> bool {
        let state = self.state.read().await;
        matches!(state.current_batcher, TransactionBatcherHandle::LocalSequencer(_))
            && state.lockout_expires_at.is_some_and(|expires| Utc::now() < expires)
    }

    /// Read path used by the facade: downgrades a stale
    /// local-sequencer claim to an error batcher if the lease has
    /// actually expired (spec.md §4.3 "additional safety predicate").
    async fn snapshot_batcher(&self) -> Arc<dyn TransactionBatcher> {
        let state = self.state.read().await;
        if matches!(state.current_batcher, TransactionBatcherHandle::LocalSequencer(_))
            && !state.lockout_expires_at.is_some_and(|expires| Utc::now() < expires)
        {
            return Arc::new(ErrorBatcher::new("sequencer lockout expired"));
        }
        match &state.current_batcher {
            TransactionBatcherHandle::LocalSequencer(b) => b.clone() as Arc<dyn TransactionBatcher>,
            TransactionBatcherHandle::Forwarder(b) => b.clone() as Arc<dyn TransactionBatcher>,
            TransactionBatcherHandle::Error(b) => b.clone() as Arc<dyn TransactionBatcher>,
        }
    }

    /// Facade delegation (spec.md §4.4): acquire read lock, snapshot with
    /// the expiry safety check, release, delegate.
    pub async fn send_transaction(&self, tx: Vec<u8>) -> Result<(), BatcherError> {
        self.snapshot_batcher().await.send_transaction(tx).await
    }

    pub async fn pending_transaction_count(&self, account: alloy_primitives::Address) -> Option<u64> {
        self.snapshot_batcher().await.pending_transaction_count(account)
    }

    pub async fn pending_snapshot(&self) -> Result<crate::batcher::Snapshot, BatcherError> {
        self.snapshot_batcher().await.pending_snapshot()
    }

    pub async fn aggregator(&self) -> Option<alloy_primitives::Address> {
        self.snapshot_batcher().await.aggregator()
    }

    /// Runs the per-tick state machine until `shutdown` fires, then
    /// performs graceful teardown. If the loop exits for any other
    /// reason this is a fatal internal error (spec.md §4.3 Lifecycle).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.shut_down().await;
                        return;
                    }
                }
                result = self.tick() => {
                    match result {
                        Ok(delay) => sleep(delay).await,
                        Err(e) => {
                            warn!("lockout manager tick failed: {e}");
                            sleep(DEFAULT_REFRESH_DELAY).await;
                        }
                    }
                }
            }
        }
    }

    async fn shut_down(&self) {
        {
            let mut state = self.state.write().await;
            state.current_batcher = TransactionBatcherHandle::Error(Arc::new(ErrorBatcher::new(
                "sequencer lockout manager shutting down",
            )));
        }
        if let Err(e) = self.store.remove_liveliness(&self.hostname).await {
            warn!("failed to remove liveliness on shutdown: {e}");
        }
    }

    /// One iteration of `lockoutManager`. Returns the delay before the
    /// next tick. Exposed publicly so callers (and tests) can drive the
    /// state machine deterministically instead of only via `run`.
    pub async fn tick(&self) -> Result<Duration, LockoutError> {
        self.store
            .update_liveliness(&self.hostname, self.liveliness_timeout)
            .await?;
        let selected = self.store.select_sequencer().await?;

        if selected.as_deref() == Some(self.hostname.as_str()) {
            self.try_acquire_and_activate().await?;
        } else {
            let current_seq_matches = {
                let state = self.state.read().await;
                state.current_seq.as_deref() == selected.as_deref()
            };
            if !current_seq_matches {
                self.hand_off(selected.as_deref()).await?;
            }
        }

        Ok(self.next_refresh_delay().await)
    }

    async fn try_acquire_and_activate(&self) -> Result<(), LockoutError> {
        let mut state = self.state.write().await;
        let Some(expires) = self
            .store
            .acquire_lockout(&self.hostname, self.lockout_timeout)
            .await?
        else {
            return Ok(());
        };
        let lockout_expires_at = expires - chrono::Duration::from_std(SAFETY_MARGIN).unwrap();

        if state.current_seq.as_deref() != Some(self.hostname.as_str()) {
            let target = self.store.get_latest_seq_num().await?;
            // Holds the write guard through the whole poll: readers must
            // not observe any batcher while a newly-elected host is still
            // catching up (spec.md §4.3 step 3 runs the poll inside the
            // exclusive section, not around it).
            self.wait_for_catchup(target, lockout_expires_at).await?;
            if Utc::now() < lockout_expires_at {
                state.current_batcher = TransactionBatcherHandle::LocalSequencer(self.sequencer_batcher.clone());
                state.current_seq = Some(self.hostname.clone());
            }
        } else {
            state.current_batcher = TransactionBatcherHandle::LocalSequencer(self.sequencer_batcher.clone());
            state.current_seq = Some(self.hostname.clone());
        }
        state.lockout_expires_at = Some(lockout_expires_at);
        Ok(())
    }

    /// Polls local message count until it catches up to the handing-off
    /// host's published `latest_seq_num`, or the lease's safety window
    /// elapses first (spec.md §4.3 step 3, invariant 4).
    async fn wait_for_catchup(
        &self,
        target: u64,
        lockout_expires_at: DateTime<Utc>,
    ) -> Result<(), LockoutError> {
        while Utc::now() < lockout_expires_at {
            match self.lookup.get_message_count().await {
                Ok(count) if count >= target => return Ok(()),
                Ok(_) => sleep(CATCHUP_POLL_DELAY).await,
                Err(e) => {
                    warn!("error getting local message count during catchup: {e}");
                    sleep(CATCHUP_ERROR_BACKOFF).await;
                }
            }
        }
        Ok(())
    }

    /// Handoff when a different host is elected (spec.md §4.3 step 4).
    async fn hand_off(&self, selected: Option<&str>) -> Result<(), LockoutError> {
        let was_local = {
            let state = self.state.read().await;
            matches!(state.current_batcher, TransactionBatcherHandle::LocalSequencer(_))
        };
        let _inbox_guard = if was_local {
            Some(self.inbox_delivery_lock.lock().await)
        } else {
            None
        };

        let mut state = self.state.write().await;
        if matches!(state.current_batcher, TransactionBatcherHandle::LocalSequencer(_)) {
            if let Some(expires_at) = state.lockout_expires_at {
                if Utc::now() < expires_at {
                    if let Ok(count) = self.lookup.get_message_count().await {
                        if let Err(e) = self.store.update_latest_seq_num(count).await {
                            warn!("error publishing latest_seq_num: {e}");
                        }
                    } else {
                        warn!("error getting sequence number during handoff");
                    }
                    if let Err(e) = self.store.release_lockout_no_retry(&self.hostname, expires_at).await {
                        warn!("error releasing redis sequencer lock: {e}");
                    }
                }
            }
            state.lockout_expires_at = None;
            state.current_batcher = TransactionBatcherHandle::Error(Arc::new(ErrorBatcher::new(
                "no sequencer installed during handoff",
            )));
            state.current_seq = None;
        }
        drop(_inbox_guard);

        let Some(selected) = selected else {
            return Ok(());
        };

        // Retains the exclusive section for a bounded wait while the
        // newly-elected host has not yet acquired the lease (spec.md §9):
        // readers stay on the error batcher installed above rather than
        // racing a partially-handed-off state, but the wait is bounded so a
        // peer that never shows up can't wedge this tick forever.
        let deadline = tokio::time::Instant::now() + HANDOFF_WAIT_BOUND;
        loop {
            if self.store.get_lockout().await?.as_deref() == Some(selected) {
                match ForwarderBatcher::connect(selected) {
                    Ok(forwarder) => {
                        state.current_batcher = TransactionBatcherHandle::Forwarder(Arc::new(forwarder));
                        state.current_seq = Some(selected.to_string());
                    }
                    Err(e) => {
                        warn!("failed to connect to current sequencer {selected}: {e}");
                        state.current_batcher =
                            TransactionBatcherHandle::Error(Arc::new(ErrorBatcher::new(e.to_string())));
                    }
                }
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("gave up waiting for {selected} to acquire the sequencer lease after {HANDOFF_WAIT_BOUND:?}");
                return Ok(());
            }
            sleep(CATCHUP_POLL_DELAY).await;
        }
    }

    async fn next_refresh_delay(&self) -> Duration {
        let state = self.state.read().await;
        if matches!(state.current_batcher, TransactionBatcherHandle::LocalSequencer(_)) {
            if let Some(expires_at) = state.lockout_expires_at {
                let renew_due = expires_at - chrono::Duration::from_std(SAFETY_MARGIN).unwrap();
                if let Ok(until) = (renew_due - Utc::now()).to_std() {
                    return until.max(DEFAULT_REFRESH_DELAY);
                }
            }
        }
        DEFAULT_REFRESH_DELAY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::fake::InMemoryCoordinationStore;
    use crate::execution::InMemoryArbCore;

    fn make_coordinator(
        hostname: &str,
    ) -> LockoutCoordinator<InMemoryCoordinationStore, InMemoryArbCore> {
        LockoutCoordinator::new(
            Arc::new(InMemoryCoordinationStore::new()),
            Arc::new(InMemoryArbCore::new()),
            hostname.to_string(),
            Duration::from_secs(30),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn starts_up_as_error_batcher_and_not_should_sequence() {
        let coordinator = make_coordinator("host-a");
        assert!(!coordinator.should_sequence().await);
        let err = coordinator.send_transaction(vec![1]).await.unwrap_err();
        assert!(matches!(err, BatcherError::Rejected(_)));
    }

    #[tokio::test]
    async fn sole_live_host_acquires_lockout_and_becomes_sequencer() {
        let coordinator = make_coordinator("host-a");
        coordinator.tick().await.unwrap();
        assert!(coordinator.should_sequence().await);
    }
}
