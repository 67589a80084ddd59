use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use shared::{Error, Result};

use crate::models::ResourceLockRow;
use crate::schema::resource_locks;

/// Opaque ownership proof handed out by `acquire`. Extend and release
/// only succeed while the stored token still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Mutual exclusion over named resources across processes. `acquire`
/// returning `None` means busy, which callers surface as a retryable
/// conflict, never a crash. The TTL self-heals locks whose holder died
/// without releasing.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;
    async fn extend(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool>;
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool>;
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub ttl: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_count: 10,
            retry_delay: Duration::from_millis(150),
        }
    }
}

struct LockGuard {
    manager: Arc<dyn LockManager>,
    key: String,
    token: Option<LockToken>,
}

impl LockGuard {
    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            match self.manager.release(&self.key, &token).await {
                Ok(true) => {}
                Ok(false) => warn!(key = %self.key, "lock already expired before release"),
                Err(e) => warn!(key = %self.key, "failed to release lock: {}", e),
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Reached only when the holding future was cancelled mid-flight;
        // the release still has to happen off this (sync) drop path.
        if let Some(token) = self.token.take() {
            let manager = Arc::clone(&self.manager);
            let key = std::mem::take(&mut self.key);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = manager.release(&key, &token).await {
                        warn!(key = %key, "failed to release lock on drop: {}", e);
                    }
                });
            }
        }
    }
}

/// Retries acquisition with jittered backoff, runs `f` under the lock,
/// and releases on every exit path. Exhausted retries return `Ok(None)`
/// without running `f`.
pub async fn with_lock<T, F, Fut>(
    manager: &Arc<dyn LockManager>,
    key: &str,
    opts: LockOptions,
    f: F,
) -> Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let token = loop {
        if let Some(token) = manager.acquire(key, opts.ttl).await? {
            break token;
        }
        if attempt >= opts.retry_count {
            return Ok(None);
        }
        attempt += 1;
        let base_ms = opts.retry_delay.as_millis() as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=base_ms.max(1) / 2);
        tokio::time::sleep(opts.retry_delay + Duration::from_millis(jitter_ms)).await;
    };

    let guard = LockGuard {
        manager: Arc::clone(manager),
        key: key.to_string(),
        token: Some(token),
    };
    let result = f().await;
    guard.release().await;
    result.map(Some)
}

/// Single-process backend for tests, dev mode and the
/// `--memory-backend` deployment profile. Conditional semantics match
/// the coordination-store contract: set-if-absent with expiry,
/// compare-token extend, compare-token delete.
#[derive(Default)]
pub struct MemoryLockManager {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("lock table poisoned")))?;
        let now = Instant::now();
        if let Some((_, deadline)) = entries.get(key) {
            if *deadline > now {
                return Ok(None);
            }
        }
        let token = LockToken::generate();
        entries.insert(key.to_string(), (token.0.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn extend(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("lock table poisoned")))?;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some((held, deadline)) if *held == token.0 && *deadline > now => {
                *deadline = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("lock table poisoned")))?;
        match entries.get(key) {
            Some((held, _)) if *held == token.0 => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

type DbPool = Pool<AsyncPgConnection>;

/// Relational row-lock backend: one `resource_locks` row per key, all
/// three operations single conditional statements so two round trips
/// never race each other into a stolen lock.
pub struct PgLockManager {
    pool: DbPool,
}

impl PgLockManager {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockManager for PgLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::external(format!("lock store unavailable: {e}")))?;
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| Error::Internal(anyhow::anyhow!("ttl out of range: {e}")))?;

        // Expired rows are dead holders; clear them so the insert below
        // can claim the key.
        diesel::delete(
            resource_locks::table
                .filter(resource_locks::resource_key.eq(key))
                .filter(resource_locks::expires_at.le(now)),
        )
        .execute(&mut conn)
        .await
        .map_err(|e| Error::Internal(e.into()))?;

        let token = LockToken::generate();
        let row = ResourceLockRow {
            resource_key: key.to_string(),
            token: token.0.clone(),
            expires_at,
        };
        let inserted = diesel::insert_into(resource_locks::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .map_err(|e| Error::Internal(e.into()))?;

        Ok(if inserted == 1 { Some(token) } else { None })
    }

    async fn extend(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::external(format!("lock store unavailable: {e}")))?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| Error::Internal(anyhow::anyhow!("ttl out of range: {e}")))?;
        let updated = diesel::update(
            resource_locks::table
                .filter(resource_locks::resource_key.eq(key))
                .filter(resource_locks::token.eq(token.as_str())),
        )
        .set(resource_locks::expires_at.eq(expires_at))
        .execute(&mut conn)
        .await
        .map_err(|e| Error::Internal(e.into()))?;
        Ok(updated == 1)
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::external(format!("lock store unavailable: {e}")))?;
        let deleted = diesel::delete(
            resource_locks::table
                .filter(resource_locks::resource_key.eq(key))
                .filter(resource_locks::token.eq(token.as_str())),
        )
        .execute(&mut conn)
        .await
        .map_err(|e| Error::Internal(e.into()))?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<dyn LockManager> {
        Arc::new(MemoryLockManager::new())
    }

    #[tokio::test]
    async fn second_acquire_is_busy_until_release() {
        let locks = manager();
        let token = locks
            .acquire("section:s1:reservation", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        assert!(locks
            .acquire("section:s1:reservation", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none());

        assert!(locks.release("section:s1:reservation", &token).await.unwrap());
        assert!(locks
            .acquire("section:s1:reservation", Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let locks = manager();
        let stale = locks
            .acquire("booking:b1:operation", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = locks
            .acquire("booking:b1:operation", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(fresh.is_some());
        // the dead holder's token no longer releases or extends anything
        assert!(!locks.release("booking:b1:operation", &stale).await.unwrap());
        assert!(!locks
            .extend("booking:b1:operation", &stale, Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn extend_requires_matching_token() {
        let locks = manager();
        let token = locks
            .acquire("k", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(locks.extend("k", &token, Duration::from_secs(5)).await.unwrap());
        let forged = LockToken::generate();
        assert!(!locks.extend("k", &forged, Duration::from_secs(5)).await.unwrap());
        assert!(!locks.release("k", &forged).await.unwrap());
        assert!(locks.release("k", &token).await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_releases_on_success_and_error() {
        let locks = manager();

        let ok: Option<i32> = with_lock(&locks, "k", LockOptions::default(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(ok, Some(7));

        let err = with_lock(&locks, "k", LockOptions::default(), || async {
            Err::<(), _>(Error::conflict("boom"))
        })
        .await;
        assert!(err.is_err());

        // both paths released; the key is acquirable again
        assert!(locks.acquire("k", Duration::from_secs(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn with_lock_gives_up_without_running_the_closure() {
        let locks = manager();
        let held = locks
            .acquire("busy", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let opts = LockOptions {
            ttl: Duration::from_secs(1),
            retry_count: 2,
            retry_delay: Duration::from_millis(5),
        };
        let outcome = with_lock(&locks, "busy", opts, || async {
            panic!("must not run while the lock is held elsewhere");
            #[allow(unreachable_code)]
            Ok(())
        })
        .await
        .unwrap();
        assert!(outcome.is_none());

        // giving up never leaves a second lock held
        assert!(locks.release("busy", &held).await.unwrap());
        assert!(locks.acquire("busy", Duration::from_secs(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn with_lock_serializes_concurrent_critical_sections() {
        let locks = manager();
        let in_section = Arc::new(std::sync::atomic::AtomicI32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            handles.push(tokio::spawn(async move {
                let opts = LockOptions {
                    ttl: Duration::from_secs(5),
                    retry_count: 200,
                    retry_delay: Duration::from_millis(1),
                };
                with_lock(&locks, "section:s:reservation", opts, || async {
                    let n = in_section.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    assert_eq!(n, 0, "two holders inside the critical section");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_section.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap()
            }));
        }
        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 8);
    }
}
