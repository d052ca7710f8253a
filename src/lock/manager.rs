//! Lock manager implementation.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::error::{Result, TurnstileError};
use crate::store::{AtomicScript, KeyValueStore};

use super::token::LockToken;

/// Default lease lifetime once held.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);
/// Default pause between acquisition attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Default bound on the total blocking wait.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);
/// Upper bound on the random jitter added to each retry pause.
const RETRY_JITTER_MS: u64 = 10;

/// Default prefix separating lock keys from unrelated store keys.
const DEFAULT_NAMESPACE: &str = "lock";

/// Options for blocking acquisition.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Lease lifetime once held.
    pub ttl: Duration,
    /// Pause between attempts while the key is contended.
    pub retry_interval: Duration,
    /// Bound on the total wait. Zero means a single non-blocking attempt.
    pub max_wait: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_LEASE_TTL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// A held lock: the namespaced storage key, the ownership token, and the
/// lifetime it was acquired with.
///
/// The store auto-expires the lease if it is neither renewed nor released;
/// the holder gets no notification when that happens.
#[derive(Debug, Clone)]
pub struct Lease {
    key: String,
    token: LockToken,
    ttl: Duration,
}

impl Lease {
    /// The namespaced storage key this lease occupies.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The ownership token proving this acquisition.
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// The lifetime the lease was acquired (or last renewed) with.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Serializes access to named resources across processes.
///
/// Holds no local state beyond the store handle: every acquisition races
/// through the store's conditional-set, and release/renew are token-checked
/// server-side scripts, so a lease that expired and was re-acquired under a
/// different token can never be deleted or extended by its stale holder.
pub struct LockManager<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    namespace: String,
}

impl<S: KeyValueStore + ?Sized> Clone for LockManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: self.namespace.clone(),
        }
    }
}

impl<S: KeyValueStore + ?Sized> LockManager<S> {
    /// Create a lock manager using the default `lock` key namespace.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_namespace(store, DEFAULT_NAMESPACE)
    }

    /// Create a lock manager with a custom key namespace.
    pub fn with_namespace(store: Arc<S>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn storage_key(&self, name: &str) -> String {
        format!("{}:{}", self.namespace, name)
    }

    /// Attempt to acquire the named lock once, without blocking.
    ///
    /// Returns `None` when another token already holds the key; that is a
    /// normal outcome, not an error. A fresh token is generated for every
    /// attempt.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>> {
        let key = self.storage_key(name);
        let token = LockToken::generate();

        let acquired = self.store.set_if_absent(&key, token.as_str(), ttl).await?;
        if acquired {
            debug!(key = %key, ttl = ?ttl, "Acquired lease");
            Ok(Some(Lease { key, token, ttl }))
        } else {
            trace!(key = %key, "Lease already held");
            Ok(None)
        }
    }

    /// Acquire the named lock, blocking up to `options.max_wait`.
    pub async fn acquire(&self, name: &str, options: &AcquireOptions) -> Result<Lease> {
        self.acquire_with_cancel(name, options, std::future::pending())
            .await
    }

    /// Acquire the named lock, blocking up to `options.max_wait` or until
    /// `cancel` resolves, whichever comes first.
    ///
    /// Cancellation is cooperative: the signal is checked before every
    /// attempt and while sleeping between attempts, and a cancelled acquire
    /// never leaves a lease held. No fairness across competing waiters: the
    /// first conditional-set to land wins, and starvation under high
    /// contention is possible.
    pub async fn acquire_with_cancel<F>(
        &self,
        name: &str,
        options: &AcquireOptions,
        cancel: F,
    ) -> Result<Lease>
    where
        F: Future<Output = ()> + Send,
    {
        let started = tokio::time::Instant::now();
        let deadline = started + options.max_wait;
        tokio::pin!(cancel);

        loop {
            // A caller that has already given up must not acquire.
            if futures::poll!(&mut cancel).is_ready() {
                return Err(TurnstileError::Cancelled {
                    key: self.storage_key(name),
                });
            }

            // The store round trip itself must respect the caller's
            // deadline: a hung store is indistinguishable from contention.
            match tokio::time::timeout_at(deadline, self.try_acquire(name, options.ttl)).await {
                Ok(attempt) => {
                    if let Some(lease) = attempt? {
                        return Ok(lease);
                    }
                }
                Err(_) => {
                    return Err(TurnstileError::Timeout {
                        key: self.storage_key(name),
                        waited: started.elapsed(),
                    });
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(key = %self.storage_key(name), waited = ?started.elapsed(), "Gave up waiting for lease");
                return Err(TurnstileError::Timeout {
                    key: self.storage_key(name),
                    waited: started.elapsed(),
                });
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=RETRY_JITTER_MS));
            let pause = (options.retry_interval + jitter).min(deadline - now);

            tokio::select! {
                _ = &mut cancel => {
                    return Err(TurnstileError::Cancelled {
                        key: self.storage_key(name),
                    });
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Release a held lease.
    ///
    /// Evaluated as a single compare-token-then-delete on the store. Returns
    /// [`TurnstileError::LockMismatch`] when the key is absent or holds a
    /// different token; the lease was already lost (typically expired) and
    /// the current holder, if any, is left untouched.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let outcome = self
            .store
            .evaluate(AtomicScript::CompareAndDelete {
                key: lease.key(),
                expected: lease.token().as_str(),
            })
            .await?;

        if outcome.matched() {
            debug!(key = %lease.key(), "Released lease");
            Ok(())
        } else {
            debug!(key = %lease.key(), "Lease already lost at release");
            Err(TurnstileError::LockMismatch {
                key: lease.key().to_string(),
            })
        }
    }

    /// Extend a held lease to `new_ttl` from now.
    ///
    /// Returns `false` without error when the token no longer matches: the
    /// lease expired (and was possibly re-acquired) and the caller no longer
    /// holds exclusivity. Callers whose critical sections may outlive the
    /// lease must treat `false` as a correctness violation.
    pub async fn renew(&self, lease: &Lease, new_ttl: Duration) -> Result<bool> {
        let outcome = self
            .store
            .evaluate(AtomicScript::CompareAndExtend {
                key: lease.key(),
                expected: lease.token().as_str(),
                ttl: new_ttl,
            })
            .await?;

        if outcome.matched() {
            trace!(key = %lease.key(), ttl = ?new_ttl, "Renewed lease");
        } else {
            debug!(key = %lease.key(), "Lease already lost at renewal");
        }
        Ok(outcome.matched())
    }

    /// Run `section` while holding the named lock.
    ///
    /// Acquires per `options`, runs the critical section, then releases on
    /// every exit path including a panic inside the section. A release
    /// failure is logged and swallowed: the section's own result takes
    /// precedence.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        options: &AcquireOptions,
        section: F,
    ) -> Result<T>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.acquire(name, options).await?;

        let result = AssertUnwindSafe(section(lease.clone())).catch_unwind().await;

        if let Err(e) = self.release(&lease).await {
            warn!(key = %lease.key(), error = %e, "Failed to release lease after critical section");
        }

        match result {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn manager() -> LockManager<MemoryStore> {
        LockManager::new(Arc::new(MemoryStore::new()))
    }

    fn manager_with_clock() -> (LockManager<MemoryStore>, Arc<ManualClock>) {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (LockManager::new(store), clock)
    }

    fn fast_options() -> AcquireOptions {
        AcquireOptions {
            ttl: Duration::from_secs(30),
            retry_interval: Duration::from_millis(50),
            max_wait: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_try_acquire_and_release() {
        let manager = manager();

        let lease = manager
            .try_acquire("orders", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("should acquire");
        assert_eq!(lease.key(), "lock:orders");

        manager.release(&lease).await.unwrap();

        // Released, so a new acquisition succeeds.
        assert!(manager
            .try_acquire("orders", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_try_acquire_contended_returns_none() {
        let manager = manager();

        let _held = manager
            .try_acquire("orders", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let second = manager
            .try_acquire("orders", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_try_acquire_single_winner() {
        let manager = manager();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .try_acquire("contended", Duration::from_secs(30))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_release_after_reacquisition_is_mismatch() {
        let (manager, clock) = manager_with_clock();

        let stale = manager
            .try_acquire("orders", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        // The lease expires and someone else takes the key.
        clock.advance(Duration::from_secs(6));
        let current = manager
            .try_acquire("orders", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let result = manager.release(&stale).await;
        assert!(matches!(result, Err(TurnstileError::LockMismatch { .. })));

        // The current holder's lease is untouched.
        assert_eq!(
            manager.store.get("lock:orders").await.unwrap(),
            Some(current.token().as_str().to_string())
        );
        manager.release(&current).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends_live_lease() {
        let (manager, clock) = manager_with_clock();

        let lease = manager
            .try_acquire("orders", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::from_secs(8));
        assert!(manager.renew(&lease, Duration::from_secs(30)).await.unwrap());

        // Past the original ttl, still held thanks to the renewal.
        clock.advance(Duration::from_secs(10));
        assert!(manager
            .try_acquire("orders", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_renew_after_reacquisition_returns_false() {
        let (manager, clock) = manager_with_clock();

        let stale = manager
            .try_acquire("orders", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::from_secs(6));
        let current = manager
            .try_acquire("orders", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert!(!manager.renew(&stale, Duration::from_secs(30)).await.unwrap());

        // The current holder can still renew normally.
        assert!(manager.renew(&current, Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_times_out_against_held_key() {
        let manager = manager();

        let _held = manager
            .try_acquire("busy", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let started = tokio::time::Instant::now();
        let result = manager.acquire("busy", &fast_options()).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(TurnstileError::Timeout { .. })));
        assert!(elapsed >= Duration::from_millis(180), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(400), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_acquire_zero_max_wait_is_single_attempt() {
        let manager = manager();

        let _held = manager
            .try_acquire("busy", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let options = AcquireOptions {
            max_wait: Duration::ZERO,
            ..fast_options()
        };

        let started = tokio::time::Instant::now();
        let result = manager.acquire("busy", &options).await;

        assert!(matches!(result, Err(TurnstileError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_acquire_succeeds_once_holder_releases() {
        let manager = manager();

        let held = manager
            .try_acquire("busy", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let releaser = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            releaser.release(&held).await.unwrap();
        });

        let options = AcquireOptions {
            max_wait: Duration::from_secs(2),
            retry_interval: Duration::from_millis(20),
            ..AcquireOptions::default()
        };
        let lease = manager.acquire("busy", &options).await.unwrap();
        manager.release(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_cancelled_before_timeout() {
        let manager = manager();

        let _held = manager
            .try_acquire("busy", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let options = AcquireOptions {
            max_wait: Duration::from_secs(10),
            retry_interval: Duration::from_millis(20),
            ..AcquireOptions::default()
        };

        let started = tokio::time::Instant::now();
        let result = manager
            .acquire_with_cancel("busy", &options, async {
                tokio::time::sleep(Duration::from_millis(60)).await;
            })
            .await;

        assert!(matches!(result, Err(TurnstileError::Cancelled { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_already_cancelled_acquire_never_takes_the_lock() {
        let manager = manager();

        let result = manager
            .acquire_with_cancel("free", &fast_options(), std::future::ready(()))
            .await;
        assert!(matches!(result, Err(TurnstileError::Cancelled { .. })));

        // The key was never taken.
        assert!(manager
            .try_acquire("free", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_success() {
        let manager = manager();

        let value = manager
            .with_lock("orders", &fast_options(), |_lease| async { 42 })
            .await
            .unwrap();
        assert_eq!(value, 42);

        assert!(manager
            .try_acquire("orders", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_with_lock_releases_when_section_fails() {
        let manager = manager();

        let outcome: std::result::Result<(), String> = manager
            .with_lock("orders", &fast_options(), |_lease| async {
                Err("business failure".to_string())
            })
            .await
            .unwrap();
        assert!(outcome.is_err());

        // Another token can take the lock immediately.
        assert!(manager
            .try_acquire("orders", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_panic() {
        let manager = manager();

        let runner = manager.clone();
        let handle = tokio::spawn(async move {
            runner
                .with_lock("orders", &fast_options(), |_lease| async {
                    panic!("section blew up");
                })
                .await
        });

        assert!(handle.await.unwrap_err().is_panic());

        assert!(manager
            .try_acquire("orders", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }
}
