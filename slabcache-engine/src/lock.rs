//! Distributed advisory lock over the atomic `add` primitive.
//!
//! A [`CacheLock`] claims a key with `add`, which succeeds for exactly one
//! caller, and stamps the entry with a TTL so a crashed holder can never
//! wedge the system. The TTL is therefore also the safety horizon: a holder
//! that outlives its expiration must assume another process owns the key and
//! must not delete it. Release follows a touch-then-delete sequence, which
//! confirms the entry still exists and pins its TTL so it cannot lapse
//! between the check and the delete.
//!
//! Instances are single-use: acquire once, release once. Re-acquisition
//! means constructing a new lock.

use crate::backend::KvBackend;
use rand::Rng;
use slabcache_core::{CacheKey, CacheValue, KeyNormalizer, LockError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

/// Timing parameters for [`CacheLock`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// TTL stamped on the lock entry; the holder must finish or re-extend
    /// within this window.
    pub expiration: Duration,
    /// Base pause between blocking acquire attempts. Each attempt adds up to
    /// a quarter of this as jitter so contending waiters fan out.
    pub retry_interval: Duration,
    /// Default bound on blocking acquires via [`CacheLock::with_acquired`];
    /// `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(30),
            retry_interval: Duration::from_millis(500),
            acquire_timeout: None,
        }
    }
}

impl LockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

#[derive(Clone, Copy)]
enum LockState {
    Unacquired,
    Acquired { deadline: Instant },
    Released,
}

/// Single-use distributed lock on one cache key.
pub struct CacheLock<B: KvBackend> {
    backend: Arc<B>,
    key: CacheKey,
    token: Option<String>,
    state: LockState,
    config: LockConfig,
}

impl<B: KvBackend> CacheLock<B> {
    pub fn new(backend: Arc<B>, key: &str, config: LockConfig) -> Self {
        Self {
            backend,
            key: KeyNormalizer::new().normalize(key),
            token: None,
            state: LockState::Unacquired,
            config,
        }
    }

    pub fn with_defaults(backend: Arc<B>, key: &str) -> Self {
        Self::new(backend, key, LockConfig::default())
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Token written into the lock entry, once acquired. Diagnostic only;
    /// ownership is tracked by this instance, not by token comparison.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Whether this instance holds the lock and its TTL has not lapsed.
    pub fn is_held(&self) -> bool {
        matches!(self.state, LockState::Acquired { deadline } if Instant::now() < deadline)
    }

    /// Try to take the lock.
    ///
    /// Non-blocking mode returns `Ok(false)` on contention. Blocking mode
    /// retries with jitter until the key frees up, failing with
    /// [`LockError::Timeout`] once `timeout` has elapsed. Backend errors are
    /// logged and treated as contention, so a flapping backend delays
    /// acquisition rather than failing it.
    pub async fn acquire(
        &mut self,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<bool, LockError> {
        match self.state {
            LockState::Acquired { .. } => {
                return Err(LockError::AlreadyAcquired {
                    key: self.key.to_string(),
                })
            }
            LockState::Released => {
                return Err(LockError::AlreadyReleased {
                    key: self.key.to_string(),
                })
            }
            LockState::Unacquired => {}
        }

        let token = Uuid::now_v7().to_string();
        let start = Instant::now();
        loop {
            match self
                .backend
                .add(
                    &self.key,
                    CacheValue::Text(token.clone()),
                    Some(self.config.expiration),
                )
                .await
            {
                Ok(true) => {
                    self.token = Some(token);
                    self.state = LockState::Acquired {
                        deadline: Instant::now() + self.config.expiration,
                    };
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %self.key, error = %e, "lock acquire attempt failed; retrying");
                }
            }

            if !blocking {
                return Ok(false);
            }
            if let Some(limit) = timeout {
                let waited = start.elapsed();
                if waited >= limit {
                    return Err(LockError::Timeout {
                        key: self.key.to_string(),
                        waited,
                    });
                }
            }

            let jitter_cap = self.config.retry_interval.as_millis() as u64 / 4;
            let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_cap));
            tokio::time::sleep(self.config.retry_interval + jitter).await;
        }
    }

    /// Extend the lock entry's TTL (defaulting to the configured expiration).
    ///
    /// If the entry has vanished the lock was lost: the state drops back to
    /// unacquired and `is_held` turns false. A backend error leaves the
    /// current deadline in place.
    pub async fn update_expiration(&mut self, ttl: Option<Duration>) -> Result<(), LockError> {
        match self.state {
            LockState::Unacquired => {
                return Err(LockError::NotAcquired {
                    key: self.key.to_string(),
                })
            }
            LockState::Released => {
                return Err(LockError::AlreadyReleased {
                    key: self.key.to_string(),
                })
            }
            LockState::Acquired { .. } => {}
        }

        let ttl = ttl.unwrap_or(self.config.expiration);
        match self.backend.touch(&self.key, Some(ttl)).await {
            Ok(true) => {
                self.state = LockState::Acquired {
                    deadline: Instant::now() + ttl,
                };
            }
            Ok(false) => {
                warn!(key = %self.key, "lock entry vanished; lock lost");
                self.token = None;
                self.state = LockState::Unacquired;
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to extend lock expiration");
            }
        }
        Ok(())
    }

    /// Release the lock.
    ///
    /// A holder past its expiration never deletes the entry, since another
    /// process may have acquired it in the meantime; the entry is left to
    /// its TTL. Within the window, the entry is touched first so it cannot
    /// expire mid-release, then deleted. All backend failures here are
    /// absorbed: the instance always ends released, and a leftover entry
    /// ages out.
    pub async fn release(&mut self) -> Result<(), LockError> {
        let deadline = match self.state {
            LockState::Unacquired => {
                return Err(LockError::NotAcquired {
                    key: self.key.to_string(),
                })
            }
            LockState::Released => {
                return Err(LockError::AlreadyReleased {
                    key: self.key.to_string(),
                })
            }
            LockState::Acquired { deadline } => deadline,
        };

        if Instant::now() >= deadline {
            warn!(key = %self.key, "lock held past its expiration; leaving entry to its TTL");
        } else {
            match self
                .backend
                .touch(&self.key, Some(self.config.expiration))
                .await
            {
                Ok(true) => {
                    if let Err(e) = self.backend.delete(&self.key).await {
                        warn!(key = %self.key, error = %e, "failed to delete lock entry; it will expire");
                    }
                }
                Ok(false) => {
                    warn!(key = %self.key, "lock entry vanished before release");
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "could not confirm lock entry; skipping delete");
                }
            }
        }

        self.state = LockState::Released;
        Ok(())
    }

    /// Run `f` under the lock: blocking acquire (bounded by the configured
    /// acquire timeout), then release afterwards. The closure's output is
    /// returned as-is; only acquisition can fail.
    pub async fn with_acquired<T, F, Fut>(&mut self, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(true, self.config.acquire_timeout).await?;
        let out = f().await;
        if matches!(self.state, LockState::Acquired { .. }) {
            self.release().await?;
        }
        Ok(out)
    }
}

impl<B: KvBackend> Drop for CacheLock<B> {
    fn drop(&mut self) {
        if let LockState::Acquired { .. } = self.state {
            error!(
                key = %self.key,
                "lock dropped while held; entry will expire via TTL"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::testing::{init_test_logging, DownBackend};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config() -> LockConfig {
        LockConfig::new()
            .with_expiration(Duration::from_secs(5))
            .with_retry_interval(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let backend = Arc::new(MemoryBackend::new());
        let mut a = CacheLock::new(backend.clone(), "job", config());
        let mut b = CacheLock::new(backend, "job", config());

        assert!(a.acquire(false, None).await.unwrap());
        assert!(a.is_held());
        assert!(!b.acquire(false, None).await.unwrap());
        assert!(!b.is_held());
    }

    #[tokio::test]
    async fn test_release_frees_the_key() {
        let backend = Arc::new(MemoryBackend::new());
        let mut a = CacheLock::new(backend.clone(), "job", config());
        assert!(a.acquire(false, None).await.unwrap());
        a.release().await.unwrap();

        assert!(backend.get(a.key()).await.unwrap().is_none());

        let mut b = CacheLock::new(backend, "job", config());
        assert!(b.acquire(false, None).await.unwrap());
        b.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_times_out() {
        let backend = Arc::new(MemoryBackend::new());
        let mut a = CacheLock::new(backend.clone(), "job", config());
        assert!(a.acquire(false, None).await.unwrap());

        let mut b = CacheLock::new(backend, "job", config());
        let err = b
            .acquire(true, Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        a.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_wins_after_holder_expires() {
        let backend = Arc::new(MemoryBackend::new());
        let mut a = CacheLock::new(
            backend.clone(),
            "job",
            config().with_expiration(Duration::from_secs(1)),
        );
        assert!(a.acquire(false, None).await.unwrap());

        // The holder's entry expires after 1s; the waiter's retries carry it
        // past that point.
        let mut b = CacheLock::new(backend, "job", config());
        assert!(b.acquire(true, Some(Duration::from_secs(10))).await.unwrap());
        assert!(b.is_held());

        // The original holder is past its window and must not delete.
        a.release().await.unwrap();
        assert!(b.is_held());
        b.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_reacquire_and_double_release_are_errors() {
        let backend = Arc::new(MemoryBackend::new());
        let mut lock = CacheLock::new(backend, "job", config());

        let err = lock.release().await.unwrap_err();
        assert!(matches!(err, LockError::NotAcquired { .. }));

        assert!(lock.acquire(false, None).await.unwrap());
        let err = lock.acquire(false, None).await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyAcquired { .. }));

        lock.release().await.unwrap();
        let err = lock.release().await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyReleased { .. }));
        let err = lock.acquire(false, None).await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyReleased { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_expiry_leaves_new_holder_intact() {
        let backend = Arc::new(MemoryBackend::new());
        let mut a = CacheLock::new(
            backend.clone(),
            "job",
            config().with_expiration(Duration::from_secs(1)),
        );
        assert!(a.acquire(false, None).await.unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!a.is_held());

        let mut b = CacheLock::new(backend.clone(), "job", config());
        assert!(b.acquire(false, None).await.unwrap());

        // Stale release must not take out b's entry.
        a.release().await.unwrap();
        assert!(backend.get(b.key()).await.unwrap().is_some());
        b.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_expiration_extends_the_hold() {
        let backend = Arc::new(MemoryBackend::new());
        let mut lock = CacheLock::new(
            backend.clone(),
            "job",
            config().with_expiration(Duration::from_secs(1)),
        );
        assert!(lock.acquire(false, None).await.unwrap());

        tokio::time::sleep(Duration::from_millis(600)).await;
        lock.update_expiration(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        // Without the extension both the entry and the hold would have
        // lapsed by now.
        assert!(lock.is_held());
        assert!(backend.get(lock.key()).await.unwrap().is_some());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_expiration_detects_lost_lock() {
        let backend = Arc::new(MemoryBackend::new());
        let mut lock = CacheLock::new(backend.clone(), "job", config());
        assert!(lock.acquire(false, None).await.unwrap());

        // Simulate eviction.
        backend.delete(lock.key()).await.unwrap();
        lock.update_expiration(None).await.unwrap();
        assert!(!lock.is_held());

        // A lost lock is re-acquirable.
        assert!(lock.acquire(false, None).await.unwrap());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_expiration_requires_the_hold() {
        let backend = Arc::new(MemoryBackend::new());
        let mut lock = CacheLock::new(backend, "job", config());
        let err = lock.update_expiration(None).await.unwrap_err();
        assert!(matches!(err, LockError::NotAcquired { .. }));
    }

    #[tokio::test]
    async fn test_with_acquired_runs_and_releases() {
        let backend = Arc::new(MemoryBackend::new());
        let ran = AtomicBool::new(false);

        let mut lock = CacheLock::new(backend.clone(), "job", config());
        let out = lock
            .with_acquired(|| async {
                ran.store(true, Ordering::SeqCst);
                7u32
            })
            .await
            .unwrap();

        assert_eq!(out, 7);
        assert!(ran.load(Ordering::SeqCst));
        assert!(backend.get(lock.key()).await.unwrap().is_none());

        let mut next = CacheLock::new(backend, "job", config());
        assert!(next.acquire(false, None).await.unwrap());
        next.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_treats_backend_error_as_contention() {
        init_test_logging();
        let mut lock = CacheLock::new(Arc::new(DownBackend), "job", config());
        assert!(!lock.acquire(false, None).await.unwrap());
        assert!(!lock.is_held());

        // A failed attempt leaves the instance reusable.
        assert!(!lock.acquire(false, None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_times_out_through_backend_outage() {
        init_test_logging();
        let mut lock = CacheLock::new(Arc::new(DownBackend), "job", config());
        let err = lock
            .acquire(true, Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_update_expiration_error_keeps_the_hold() {
        let mut lock = CacheLock::new(Arc::new(DownBackend), "job", config());
        lock.state = LockState::Acquired {
            deadline: Instant::now() + Duration::from_secs(30),
        };

        // A touch error is absorbed; the deadline and hold stay in place.
        lock.update_expiration(None).await.unwrap();
        assert!(lock.is_held());
        lock.state = LockState::Released;
    }

    #[tokio::test]
    async fn test_tokens_are_unique_per_acquire() {
        let backend = Arc::new(MemoryBackend::new());
        let mut a = CacheLock::new(backend.clone(), "one", config());
        let mut b = CacheLock::new(backend, "two", config());

        assert!(a.acquire(false, None).await.unwrap());
        assert!(b.acquire(false, None).await.unwrap());
        assert_ne!(a.token(), b.token());

        a.release().await.unwrap();
        b.release().await.unwrap();
    }
}
