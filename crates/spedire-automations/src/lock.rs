//! Advisory per-automation lock over a key-value store with atomic
//! "set if absent + TTL". One key per slug: `<prefix>:<slug>`, value = the
//! acquisition timestamp in epoch milliseconds.
//!
//! Contention (key already held) is a normal outcome. An unreachable or
//! unconfigured store is degraded coordination and is resolved by [`FailMode`]:
//! `open` grants, `closed` denies. Every degraded resolution is counted and
//! logged (throttled, see [`AutomationLock::acquire`]).
//!
//! Release is a plain `DEL` without an ownership token: after TTL expiry a slow
//! holder's release can delete a newer holder's key.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use spedire_core::FailMode;
use spedire_core::config::LockConfig;

/// Upper bound for a single store round-trip.
const STORE_TIMEOUT: Duration = Duration::from_secs(3);

/// Lock store failure. Never surfaced to callers of [`AutomationLock`].
#[derive(Debug, Error)]
pub enum LockStoreError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
    #[error("lock store timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid lock store url: {0}")]
    InvalidUrl(String),
}

/// Minimal contract the lock needs from its backing store.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// `SET key value NX EX ttl`. `Ok(true)` when the key was created.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, LockStoreError>;

    /// `DEL key`. Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<(), LockStoreError>;

    /// Backend name for logs and stats.
    fn backend(&self) -> &'static str;
}

// ─── In-memory store ──────────────────────────────────────

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// Process-local store with expiry. Single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`, if it has not expired.
    pub async fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|e| Instant::now() < e.expires_at)
            .map(|e| e.value.clone())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(key)
            && Instant::now() < entry.expires_at
        {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), LockStoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ─── Redis store ──────────────────────────────────────────

/// Redis-backed store. Connects lazily and reconnects after any error.
pub struct RedisLockStore {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    timeout: Duration,
}

impl RedisLockStore {
    /// Parse the URL. No connection is made until the first command.
    pub fn new(url: &str) -> Result<Self, LockStoreError> {
        let client =
            redis::Client::open(url).map_err(|e| LockStoreError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            timeout: STORE_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connection(&self) -> Result<MultiplexedConnection, LockStoreError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = tokio::time::timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| LockStoreError::Timeout(self.timeout))?
            .map_err(map_redis_error)?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection so the next command reconnects.
    async fn reset(&self) {
        *self.conn.lock().await = None;
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, LockStoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        let outcome = match tokio::time::timeout(self.timeout, op(conn)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => map_redis_error(e),
            Err(_) => LockStoreError::Timeout(self.timeout),
        };
        self.reset().await;
        Err(outcome)
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        let secs = ttl.as_secs().max(1);
        let reply: Option<String> = self
            .run(|mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(secs)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), LockStoreError> {
        let _: i64 = self
            .run(|mut conn| async move { redis::cmd("DEL").arg(key).query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

fn map_redis_error(err: redis::RedisError) -> LockStoreError {
    LockStoreError::Unavailable(err.to_string())
}

// ─── Automation lock ──────────────────────────────────────

/// Counter snapshot, served by the gateway and the CLI.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockStats {
    pub backend: String,
    pub fail_mode: FailMode,
    pub acquired: u64,
    pub contended: u64,
    pub fail_open: u64,
    pub fail_closed: u64,
    pub released: u64,
    pub release_errors: u64,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    contended: AtomicU64,
    fail_open: AtomicU64,
    fail_closed: AtomicU64,
    released: AtomicU64,
    release_errors: AtomicU64,
    /// Consecutive degraded resolutions; reset by a healthy round-trip.
    degraded_streak: AtomicU64,
}

/// Per-slug advisory lock with fail-mode policy and counters.
pub struct AutomationLock {
    store: Option<Arc<dyn LockStore>>,
    fail_mode: FailMode,
    ttl: Duration,
    key_prefix: String,
    repeat_warn_every: u64,
    counters: Counters,
}

impl AutomationLock {
    pub fn new(store: Option<Arc<dyn LockStore>>, config: &LockConfig) -> Self {
        Self {
            store,
            fail_mode: config.fail_mode,
            ttl: Duration::from_secs(config.ttl_secs),
            key_prefix: config.key_prefix.clone(),
            repeat_warn_every: config.repeat_warn_every,
            counters: Counters::default(),
        }
    }

    /// Build from config: Redis when `redis_url` is set, no store otherwise.
    pub fn from_config(config: &LockConfig) -> Result<Self, LockStoreError> {
        let store: Option<Arc<dyn LockStore>> = if config.redis_url.trim().is_empty() {
            tracing::warn!(
                "🔓 No lock store configured; every acquisition resolves by fail mode '{}'",
                config.fail_mode
            );
            None
        } else {
            Some(Arc::new(RedisLockStore::new(&config.redis_url)?))
        };
        Ok(Self::new(store, config))
    }

    pub fn key(&self, slug: &str) -> String {
        format!("{}:{}", self.key_prefix, slug)
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn backend(&self) -> &'static str {
        self.store.as_ref().map_or("none", |s| s.backend())
    }

    /// Acquire with the configured TTL.
    ///
    /// `true` means the caller holds the lock, or the store is degraded and
    /// the fail mode is `open`. Degraded events warn on the first occurrence of
    /// a streak and every `repeat_warn_every`-th one after; the rest go to debug.
    pub async fn acquire(&self, slug: &str) -> bool {
        self.acquire_with_ttl(slug, self.ttl).await
    }

    pub async fn acquire_with_ttl(&self, slug: &str, ttl: Duration) -> bool {
        let Some(store) = self.store.as_ref() else {
            return self.resolve_degraded(slug, "no lock store configured");
        };

        let key = self.key(slug);
        let value = chrono::Utc::now().timestamp_millis().to_string();
        match store.set_nx_ex(&key, &value, ttl).await {
            Ok(true) => {
                self.mark_healthy(store.backend());
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("🔒 Lock acquired: {key} (ttl {}s)", ttl.as_secs());
                true
            }
            Ok(false) => {
                self.mark_healthy(store.backend());
                self.counters.contended.fetch_add(1, Ordering::Relaxed);
                tracing::info!("⏳ Lock held by another run: {key}");
                false
            }
            Err(e) => self.resolve_degraded(slug, &e.to_string()),
        }
    }

    /// Delete the lock key. Never fails; errors are counted and logged.
    pub async fn release(&self, slug: &str) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let key = self.key(slug);
        match store.del(&key).await {
            Ok(()) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("🔓 Lock released: {key}");
            }
            Err(e) => {
                self.counters.release_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("⚠️ Lock release failed for {key}: {e} (key expires with its TTL)");
            }
        }
    }

    pub fn stats(&self) -> LockStats {
        let c = &self.counters;
        LockStats {
            backend: self.backend().to_string(),
            fail_mode: self.fail_mode,
            acquired: c.acquired.load(Ordering::Relaxed),
            contended: c.contended.load(Ordering::Relaxed),
            fail_open: c.fail_open.load(Ordering::Relaxed),
            fail_closed: c.fail_closed.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            release_errors: c.release_errors.load(Ordering::Relaxed),
        }
    }

    fn resolve_degraded(&self, slug: &str, reason: &str) -> bool {
        let granted = self.fail_mode == FailMode::Open;
        if granted {
            self.counters.fail_open.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.fail_closed.fetch_add(1, Ordering::Relaxed);
        }

        let streak = self.counters.degraded_streak.fetch_add(1, Ordering::Relaxed) + 1;
        let outcome = if granted { "granted (fail-open)" } else { "denied (fail-closed)" };
        if should_warn(streak, self.repeat_warn_every) {
            tracing::warn!(
                "⚠️ Degraded lock coordination for '{slug}': {reason}; lock {outcome} [streak {streak}]"
            );
        } else {
            tracing::debug!(
                "Degraded lock coordination for '{slug}': {reason}; lock {outcome} [streak {streak}]"
            );
        }
        granted
    }

    fn mark_healthy(&self, backend: &str) {
        let streak = self.counters.degraded_streak.swap(0, Ordering::Relaxed);
        if streak > 0 {
            tracing::info!("✅ Lock store '{backend}' recovered after {streak} degraded attempts");
        }
    }
}

/// First event of a streak, then every `every`-th.
fn should_warn(streak: u64, every: u64) -> bool {
    streak == 1 || (every > 0 && streak % every == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Store that fails while `down` is set, otherwise delegates to memory.
    struct FlakyStore {
        down: AtomicBool,
        inner: MemoryLockStore,
        dels: AtomicU64,
    }

    impl FlakyStore {
        fn new(down: bool) -> Self {
            Self {
                down: AtomicBool::new(down),
                inner: MemoryLockStore::new(),
                dels: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl LockStore for FlakyStore {
        async fn set_nx_ex(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<bool, LockStoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(LockStoreError::Unavailable("connection refused".into()));
            }
            self.inner.set_nx_ex(key, value, ttl).await
        }

        async fn del(&self, key: &str) -> Result<(), LockStoreError> {
            self.dels.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(LockStoreError::Unavailable("connection refused".into()));
            }
            self.inner.del(key).await
        }

        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    fn config(mode: FailMode) -> LockConfig {
        LockConfig {
            fail_mode: mode,
            ..Default::default()
        }
    }

    fn memory_lock() -> AutomationLock {
        AutomationLock::new(Some(Arc::new(MemoryLockStore::new())), &config(FailMode::Open))
    }

    #[test]
    fn test_key_format() {
        let lock = memory_lock();
        assert_eq!(lock.key("low-balance-alert"), "automation:lock:low-balance-alert");
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let lock = Arc::new(memory_lock());
        let (a, b) = tokio::join!(lock.acquire("billing"), lock.acquire("billing"));
        assert!(a ^ b, "exactly one concurrent acquire must win");

        let stats = lock.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.contended, 1);
        assert_eq!(stats.fail_open, 0);

        lock.release("billing").await;
        assert!(lock.acquire("billing").await);
    }

    #[tokio::test]
    async fn test_distinct_slugs_do_not_contend() {
        let lock = memory_lock();
        assert!(lock.acquire("a").await);
        assert!(lock.acquire("b").await);
    }

    #[tokio::test]
    async fn test_memory_ttl_expiry() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = AutomationLock::new(Some(store.clone()), &config(FailMode::Open));
        assert!(lock.acquire_with_ttl("slow", Duration::from_millis(20)).await);
        let value = store.holder(&lock.key("slow")).await.unwrap();
        assert!(value.parse::<i64>().is_ok(), "value is the acquisition timestamp");
        assert!(!lock.acquire("slow").await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.holder(&lock.key("slow")).await.is_none());
        assert!(lock.acquire("slow").await);
    }

    #[tokio::test]
    async fn test_fail_open_grants() {
        let lock = AutomationLock::new(Some(Arc::new(FlakyStore::new(true))), &config(FailMode::Open));
        assert!(lock.acquire("billing").await);
        let stats = lock.stats();
        assert_eq!(stats.fail_open, 1);
        assert_eq!(stats.fail_closed, 0);
        assert_eq!(stats.acquired, 0);
    }

    #[tokio::test]
    async fn test_fail_closed_denies() {
        let lock =
            AutomationLock::new(Some(Arc::new(FlakyStore::new(true))), &config(FailMode::Closed));
        assert!(!lock.acquire("billing").await);
        let stats = lock.stats();
        assert_eq!(stats.fail_closed, 1);
        assert_eq!(stats.contended, 0);
    }

    #[tokio::test]
    async fn test_unconfigured_store_uses_fail_mode() {
        let open = AutomationLock::new(None, &config(FailMode::Open));
        assert!(open.acquire("x").await);
        assert_eq!(open.backend(), "none");
        let closed = AutomationLock::new(None, &config(FailMode::Closed));
        assert!(!closed.acquire("x").await);
        assert_eq!(closed.stats().fail_closed, 1);
        // nothing to delete without a store
        closed.release("x").await;
        assert_eq!(closed.stats().released, 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let lock = memory_lock();
        lock.release("never-acquired").await;
        assert!(lock.acquire("x").await);
        lock.release("x").await;
        lock.release("x").await;
        assert_eq!(lock.stats().released, 3);
        assert_eq!(lock.stats().release_errors, 0);
    }

    #[tokio::test]
    async fn test_release_error_is_counted_not_raised() {
        let lock = AutomationLock::new(Some(Arc::new(FlakyStore::new(true))), &config(FailMode::Open));
        lock.release("x").await;
        assert_eq!(lock.stats().release_errors, 1);
    }

    #[tokio::test]
    async fn test_recovery_resets_streak() {
        let store = Arc::new(FlakyStore::new(true));
        let lock = AutomationLock::new(Some(store.clone()), &config(FailMode::Closed));
        assert!(!lock.acquire("x").await);
        assert!(!lock.acquire("x").await);
        assert_eq!(lock.counters.degraded_streak.load(Ordering::Relaxed), 2);

        store.down.store(false, Ordering::SeqCst);
        assert!(lock.acquire("x").await);
        assert_eq!(lock.counters.degraded_streak.load(Ordering::Relaxed), 0);
        assert_eq!(lock.stats().fail_closed, 2);
    }

    #[test]
    fn test_warning_throttle() {
        let warned: Vec<u64> = (1..=25).filter(|s| should_warn(*s, 10)).collect();
        assert_eq!(warned, vec![1, 10, 20]);
        // 0 disables repeats
        assert!(should_warn(1, 0));
        assert!(!should_warn(2, 0));
    }

    #[test]
    fn test_redis_store_parses_url_without_connecting() {
        let store = RedisLockStore::new("redis://127.0.0.1:6379").unwrap();
        assert_eq!(store.backend(), "redis");
        assert!(RedisLockStore::new("not a url").is_err());
    }

    #[test]
    fn test_from_config_without_url() {
        let lock = AutomationLock::from_config(&LockConfig::default()).unwrap();
        assert_eq!(lock.backend(), "none");
        assert_eq!(lock.ttl(), Duration::from_secs(300));
        assert_eq!(lock.fail_mode(), FailMode::Open);
    }
}
