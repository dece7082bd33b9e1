//! Advisory mutual exclusion for ledger mutations.
//!
//! [`LocalLockService`] serialises callers inside one process.
//! [`RedisLockService`] extends the same guarantee across processes with
//! `SET NX PX` plus a compare-and-delete release, so a crashed holder's
//! lock expires after its TTL instead of wedging the property. A live
//! holder's TTL is refreshed in the background until release.
//!
//! [`acquire_ledger_lease`] makes one process the only writer of the
//! calendar ledger for as long as it runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::Pool;
use deadpool_redis::redis::cmd;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use ulid::Ulid;

/// Lock-service key held for the whole life of the ledger-owning process.
pub const LEDGER_LEASE_KEY: &str = "chansync:lock:ledger-owner";

#[derive(Debug)]
pub enum LockError {
    Timeout { key: String, waited: Duration },
    Backend(String),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Timeout { key, waited } => {
                write!(f, "lock {key} not acquired within {}ms", waited.as_millis())
            }
            LockError::Backend(e) => write!(f, "lock backend error: {e}"),
        }
    }
}

impl std::error::Error for LockError {}

/// Proof of holding a lock. Hand it back to [`LockService::release`].
///
/// Dropping a local token also releases it; a dropped Redis token stops
/// being refreshed and lapses when its TTL runs out.
pub struct LockToken {
    key: String,
    token: String,
    _local: Option<OwnedMutexGuard<()>>,
    _keepalive: Option<DropGuard>,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockToken").field("key", &self.key).finish()
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire `key`, waiting at most `wait`.
    async fn acquire(&self, key: &str, wait: Duration) -> Result<LockToken, LockError>;

    async fn release(&self, token: LockToken) -> Result<(), LockError>;
}

// ── In-process ───────────────────────────────────────────────────

#[derive(Default)]
pub struct LocalLockService {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for LocalLockService {
    async fn acquire(&self, key: &str, wait: Duration) -> Result<LockToken, LockError> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockToken {
                key: key.to_string(),
                token: String::new(),
                _local: Some(guard),
                _keepalive: None,
            }),
            Err(_) => Err(LockError::Timeout {
                key: key.to_string(),
                waited: wait,
            }),
        }
    }

    async fn release(&self, token: LockToken) -> Result<(), LockError> {
        drop(token);
        Ok(())
    }
}

// ── Redis ────────────────────────────────────────────────────────

const RELEASE_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

const REFRESH_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('pexpire', KEYS[1], ARGV[2]) else return 0 end";

async fn refresh(pool: &Pool, key: &str, token: &str, ttl_ms: u64) -> Result<bool, LockError> {
    let mut conn = pool.get().await.map_err(|e| LockError::Backend(e.to_string()))?;
    let refreshed: i64 = cmd("EVAL")
        .arg(REFRESH_SCRIPT)
        .arg(1)
        .arg(key)
        .arg(token)
        .arg(ttl_ms)
        .query_async(&mut conn)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;
    Ok(refreshed != 0)
}

/// Re-arms the TTL every third of it until `cancel` fires. Stops once the
/// key no longer carries `token`.
async fn keepalive(pool: Pool, key: String, token: String, ttl: Duration, cancel: CancellationToken) {
    let every = (ttl / 3).max(Duration::from_millis(10));
    let ttl_ms = ttl.as_millis() as u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = refresh(&pool, &key, &token, ttl_ms) => match result {
                Ok(true) => {}
                Ok(false) => {
                    warn!(key = %key, "redis lock lost before release");
                    return;
                }
                Err(e) => warn!(key = %key, "lock refresh failed: {e}"),
            },
        }
    }
}

pub struct RedisLockService {
    pool: Pool,
    ttl: Duration,
    retry_every: Duration,
}

impl RedisLockService {
    pub fn new(pool: Pool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            retry_every: Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, key: &str, wait: Duration) -> Result<LockToken, LockError> {
        let token = Ulid::new().to_string();
        let started = Instant::now();
        let ttl_ms = self.ttl.as_millis() as u64;

        loop {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            let reply: Option<String> = cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            if reply.is_some() {
                debug!(key, "acquired redis lock");
                let cancel = CancellationToken::new();
                tokio::spawn(keepalive(
                    self.pool.clone(),
                    key.to_string(),
                    token.clone(),
                    self.ttl,
                    cancel.clone(),
                ));
                return Ok(LockToken {
                    key: key.to_string(),
                    token,
                    _local: None,
                    _keepalive: Some(cancel.drop_guard()),
                });
            }
            drop(conn);

            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: wait,
                });
            }
            tokio::time::sleep(self.retry_every.min(wait - elapsed)).await;
        }
    }

    async fn release(&self, token: LockToken) -> Result<(), LockError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        let deleted: i64 = cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(&token.key)
            .arg(&token.token)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        if deleted == 0 {
            warn!(key = %token.key, "redis lock expired before release");
        }
        Ok(())
    }
}

/// Take [`LEDGER_LEASE_KEY`]. A second process sharing the same lock
/// service fails here instead of writing to a ledger of its own.
pub async fn acquire_ledger_lease(locks: &dyn LockService, wait: Duration) -> Result<LockToken, LockError> {
    match locks.acquire(LEDGER_LEASE_KEY, wait).await {
        Ok(token) => Ok(token),
        Err(LockError::Timeout { .. }) => Err(LockError::Backend(
            "ledger is owned by another chansync instance".into(),
        )),
        Err(e) => Err(e),
    }
}
