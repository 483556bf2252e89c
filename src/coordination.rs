//! Redis-backed coordination primitives backing the Lockout Coordinator
//! (spec.md §4.3): liveliness heartbeats, sequencer election, the
//! exclusive lockout lease, and the handoff sequence-number rendezvous.
//! Grounded on `original_source/.../rpc/lockout.go`'s `lockoutRedis`
//! method set (`updateLiveliness`, `selectSequencer`, `acquireLockout`,
//! `getLockout`, `releaseLockoutNoRetry`, `updateLatestSeqNum`,
//! `getLatestSeqNum`); the concrete Redis key scheme and the sequencer
//! election rule are not present in the retrieved source (only the
//! call sites are), so they are original to this crate (see DESIGN.md).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
    #[error("redis pool configuration error: {0}")]
    PoolConfig(String),
}

const LIVELINESS_KEY_PREFIX: &str = "rollup:liveliness:";
const LOCKOUT_KEY: &str = "rollup:lockout";
const LATEST_SEQ_NUM_KEY: &str = "rollup:latest_seq_num";

/// The coordination-store contract the lockout loop drives.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn update_liveliness(&self, hostname: &str, timeout: Duration) -> Result<(), CoordinationError>;
    async fn remove_liveliness(&self, hostname: &str) -> Result<(), CoordinationError>;

    /// Elects the sequencer among currently-live hosts. Deterministic
    /// given the same set of live hosts.
    async fn select_sequencer(&self) -> Result<Option<String>, CoordinationError>;

    /// Attempts to acquire the exclusive lockout lease for `hostname`.
    /// Returns the lease's absolute expiry if acquired (whether newly
    /// taken or already held by `hostname`), `None` if held by someone
    /// else.
    async fn acquire_lockout(
        &self,
        hostname: &str,
        timeout: Duration,
    ) -> Result<Option<DateTime<Utc>>, CoordinationError>;

    async fn get_lockout(&self) -> Result<Option<String>, CoordinationError>;

    /// Releases the lease iff still held by `hostname`, aborting (without
    /// retry) if `deadline` passes first.
    async fn release_lockout_no_retry(
        &self,
        hostname: &str,
        deadline: DateTime<Utc>,
    ) -> Result<(), CoordinationError>;

    async fn update_latest_seq_num(&self, seq_num: u64) -> Result<(), CoordinationError>;
    async fn get_latest_seq_num(&self) -> Result<u64, CoordinationError>;
}

/// Real Redis-backed store.
pub struct RedisCoordinationStore {
    pool: Pool,
}

impl RedisCoordinationStore {
    pub fn new(redis_url: &str) -> Result<Self, CoordinationError> {
        let cfg = PoolConfig::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CoordinationError::PoolConfig(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn update_liveliness(&self, hostname: &str, timeout: Duration) -> Result<(), CoordinationError> {
        let mut conn = self.pool.get().await?;
        let key = format!("{LIVELINESS_KEY_PREFIX}{hostname}");
        let _: () = conn.set_ex(key, Utc::now().timestamp(), timeout.as_secs().max(1)).await?;
        Ok(())
    }

    async fn remove_liveliness(&self, hostname: &str) -> Result<(), CoordinationError> {
        let mut conn = self.pool.get().await?;
        let key = format!("{LIVELINESS_KEY_PREFIX}{hostname}");
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn select_sequencer(&self) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.pool.get().await?;
        let pattern = format!("{LIVELINESS_KEY_PREFIX}*");
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys
            .into_iter()
            .map(|k| k.trim_start_matches(LIVELINESS_KEY_PREFIX).to_string())
            .min())
    }

    async fn acquire_lockout(
        &self,
        hostname: &str,
        timeout: Duration,
    ) -> Result<Option<DateTime<Utc>>, CoordinationError> {
        let mut conn = self.pool.get().await?;
        let ttl_ms = timeout.as_millis().max(1) as u64;
        let set: bool = redis::cmd("SET")
            .arg(LOCKOUT_KEY)
            .arg(hostname)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();
        if set {
            return Ok(Some(Utc::now() + chrono::Duration::milliseconds(ttl_ms as i64)));
        }
        let held_by: Option<String> = conn.get(LOCKOUT_KEY).await?;
        if held_by.as_deref() != Some(hostname) {
            return Ok(None);
        }
        let ttl: i64 = conn.pttl(LOCKOUT_KEY).await?;
        if ttl < 0 {
            return Ok(None);
        }
        let _: () = conn.pexpire(LOCKOUT_KEY, ttl_ms as i64).await?;
        Ok(Some(Utc::now() + chrono::Duration::milliseconds(ttl_ms as i64)))
    }

    async fn get_lockout(&self) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get(LOCKOUT_KEY).await?)
    }

    async fn release_lockout_no_retry(
        &self,
        hostname: &str,
        deadline: DateTime<Utc>,
    ) -> Result<(), CoordinationError> {
        if Utc::now() >= deadline {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let held_by: Option<String> = conn.get(LOCKOUT_KEY).await?;
        if held_by.as_deref() == Some(hostname) {
            let _: () = conn.del(LOCKOUT_KEY).await?;
        }
        Ok(())
    }

    async fn update_latest_seq_num(&self, seq_num: u64) -> Result<(), CoordinationError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set(LATEST_SEQ_NUM_KEY, seq_num).await?;
        Ok(())
    }

    async fn get_latest_seq_num(&self) -> Result<u64, CoordinationError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get(LATEST_SEQ_NUM_KEY).await?.unwrap_or(0))
    }
}

/// In-memory `CoordinationStore`, for tests and single-node dev setups.
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        liveliness: HashMap<String, DateTime<Utc>>,
        lockout: Option<(String, DateTime<Utc>)>,
        latest_seq_num: u64,
    }

    /// In-memory fake, for tests.
    #[derive(Default)]
    pub struct InMemoryCoordinationStore {
        inner: Mutex<State>,
    }

    impl InMemoryCoordinationStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl CoordinationStore for InMemoryCoordinationStore {
        async fn update_liveliness(&self, hostname: &str, timeout: Duration) -> Result<(), CoordinationError> {
            let mut inner = self.inner.lock().unwrap();
            inner
                .liveliness
                .insert(hostname.to_string(), Utc::now() + chrono::Duration::from_std(timeout).unwrap());
            Ok(())
        }

        async fn remove_liveliness(&self, hostname: &str) -> Result<(), CoordinationError> {
            self.inner.lock().unwrap().liveliness.remove(hostname);
            Ok(())
        }

        async fn select_sequencer(&self) -> Result<Option<String>, CoordinationError> {
            let inner = self.inner.lock().unwrap();
            let now = Utc::now();
            Ok(inner
                .liveliness
                .iter()
                .filter(|(_, expiry)| **expiry > now)
                .map(|(host, _)| host.clone())
                .min())
        }

        async fn acquire_lockout(
            &self,
            hostname: &str,
            timeout: Duration,
        ) -> Result<Option<DateTime<Utc>>, CoordinationError> {
            let mut inner = self.inner.lock().unwrap();
            let now = Utc::now();
            let new_expiry = now + chrono::Duration::from_std(timeout).unwrap();
            match &inner.lockout {
                Some((holder, expiry)) if holder != hostname && *expiry > now => Ok(None),
                _ => {
                    inner.lockout = Some((hostname.to_string(), new_expiry));
                    Ok(Some(new_expiry))
                }
            }
        }

        async fn get_lockout(&self) -> Result<Option<String>, CoordinationError> {
            let inner = self.inner.lock().unwrap();
            let now = Utc::now();
            Ok(inner
                .lockout
                .as_ref()
                .filter(|(_, expiry)| *expiry > now)
                .map(|(host, _)| host.clone()))
        }

        async fn release_lockout_no_retry(
            &self,
            hostname: &str,
            deadline: DateTime<Utc>,
        ) -> Result<(), CoordinationError> {
            if Utc::now() >= deadline {
                return Ok(());
            }
            let mut inner = self.inner.lock().unwrap();
            if matches!(&inner.lockout, Some((holder, _)) if holder == hostname) {
                inner.lockout = None;
            }
            Ok(())
        }

        async fn update_latest_seq_num(&self, seq_num: u64) -> Result<(), CoordinationError> {
            self.inner.lock().unwrap().latest_seq_num = seq_num;
            Ok(())
        }

        async fn get_latest_seq_num(&self) -> Result<u64, CoordinationError> {
            Ok(self.inner.lock().unwrap().latest_seq_num)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn acquire_lockout_blocks_other_hosts_until_expiry() {
            let store = InMemoryCoordinationStore::new();
            let expiry = store
                .acquire_lockout("host-a", Duration::from_secs(30))
                .await
                .unwrap();
            assert!(expiry.is_some());
            let blocked = store.acquire_lockout("host-b", Duration::from_secs(30)).await.unwrap();
            assert!(blocked.is_none());
        }

        #[tokio::test]
        async fn select_sequencer_picks_lowest_live_hostname() {
            let store = InMemoryCoordinationStore::new();
            store.update_liveliness("host-b", Duration::from_secs(30)).await.unwrap();
            store.update_liveliness("host-a", Duration::from_secs(30)).await.unwrap();
            assert_eq!(store.select_sequencer().await.unwrap(), Some("host-a".to_string()));
        }
    }
}
