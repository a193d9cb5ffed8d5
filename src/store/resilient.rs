//! Timeout and retry wrapper for shared-store calls.
//!
//! Each call is bounded by `timeout`. Transient failures (timeouts, lost
//! connections) are retried up to `max_retries` times with exponential
//! backoff plus jitter; other errors are returned at once.
//!
//! `set_if_absent` and `incr_with_expiry` are not idempotent. After a timeout
//! or a dropped connection the backend may already have applied them, so they
//! are only repeated when the failure proves the call was never sent.

use async_trait::async_trait;
use rand::Rng;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

use super::{SharedStore, StoreError, StoreResult, WindowCount};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    timeout: Duration,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// `initial_backoff * 2^attempt`, capped, plus up to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.0..=0.5);
        base + base.mul_f64(jitter)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Replay {
    /// Repeating the call cannot change its outcome.
    Idempotent,
    /// Repeat only when the first attempt never reached the backend.
    UnlessApplied,
}

impl Replay {
    fn allows(self, err: &StoreError) -> bool {
        err.is_transient() && (self == Self::Idempotent || !err.may_have_applied())
    }
}

/// Store decorator adding timeouts and bounded retries.
pub struct ResilientStore {
    inner: Arc<dyn SharedStore>,
    config: RetryConfig,
}

impl ResilientStore {
    #[must_use]
    pub fn new(inner: Arc<dyn SharedStore>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        replay: Replay,
        mut call: F,
    ) -> StoreResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.config.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.config.timeout)),
            };

            match result {
                Err(err) if replay.allows(&err) && attempt < self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    debug!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient store error, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if replay.allows(&err) {
                        warn!(operation, attempts = attempt + 1, "store retries exhausted: {err}");
                    } else if err.is_transient() {
                        warn!(operation, "store call may have been applied, not retrying: {err}");
                    }
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[async_trait]
impl SharedStore for ResilientStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.call("get", Replay::Idempotent, || self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.call("set", Replay::Idempotent, || self.inner.set(key, value, ttl)).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.call("set_if_absent", Replay::UnlessApplied, || {
            self.inner.set_if_absent(key, value, ttl)
        })
        .await
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        self.call("incr_with_expiry", Replay::UnlessApplied, || {
            self.inner.incr_with_expiry(key, window)
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.call("delete", Replay::Idempotent, || self.inner.delete(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{faulty::FaultyStore, MemoryStore};
    use anyhow::Result;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn refused() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }

    fn reset() -> StoreError {
        StoreError::Interrupted("connection reset by peer".to_string())
    }

    fn bad_query() -> StoreError {
        StoreError::Backend("bad query".to_string())
    }

    /// Fails the first `failures` calls with the given error, then delegates.
    struct Failing {
        inner: MemoryStore,
        failures: AtomicU32,
        calls: AtomicU32,
        error: fn() -> StoreError,
        hang: bool,
    }

    impl Failing {
        fn new(failures: u32, error: fn() -> StoreError) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                error,
                hang: false,
            }
        }

        async fn gate(&self) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(());
            }
            self.failures.store(remaining - 1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    #[async_trait]
    impl SharedStore for Failing {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.gate().await?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
            self.gate().await?;
            self.inner.set(key, value, ttl).await
        }

        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
            self.gate().await?;
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn incr_with_expiry(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
            self.gate().await?;
            self.inner.incr_with_expiry(key, window).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.gate().await?;
            self.inner.delete(key).await
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig::default()
            .with_initial_backoff(Duration::from_millis(1))
            .with_max_backoff(Duration::from_millis(2))
    }

    #[tokio::test]
    async fn transient_errors_are_retried() -> Result<()> {
        let failing = Arc::new(Failing::new(2, refused));
        let store = ResilientStore::new(failing.clone(), fast_config());
        store.set("k", "v", None).await?;
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let failing = Arc::new(Failing::new(10, refused));
        let store = ResilientStore::new(failing.clone(), fast_config().with_max_retries(2));
        let err = store.get("k").await.err();
        assert!(matches!(err, Some(StoreError::Unavailable(_))));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let failing = Arc::new(Failing::new(1, bad_query));
        let store = ResilientStore::new(failing.clone(), fast_config());
        let err = store.get("k").await.err();
        assert!(matches!(err, Some(StoreError::Backend(_))));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_calls_time_out() {
        let mut failing = Failing::new(0, refused);
        failing.hang = true;
        let config = fast_config()
            .with_timeout(Duration::from_millis(50))
            .with_max_retries(0);
        let store = ResilientStore::new(Arc::new(failing), config);
        let err = store.get("k").await.err();
        assert!(matches!(err, Some(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn unsent_claims_are_retried() -> Result<()> {
        let failing = Arc::new(Failing::new(1, refused));
        let store = ResilientStore::new(failing.clone(), fast_config());
        assert!(store.set_if_absent("k", "v", Duration::from_secs(60)).await?);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_counters_are_not_counted_twice() {
        let failing = Arc::new(Failing::new(1, reset));
        let store = ResilientStore::new(failing.clone(), fast_config());
        let err = store.incr_with_expiry("k", Duration::from_secs(60)).await.err();
        assert!(matches!(err, Some(StoreError::Interrupted(_))));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interrupted_reads_are_retried() -> Result<()> {
        let failing = Arc::new(Failing::new(1, reset));
        let store = ResilientStore::new(failing.clone(), fast_config());
        assert_eq!(store.get("k").await?, None);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn claim_applied_before_timeout_is_not_repeated() -> Result<()> {
        let faulty = Arc::new(FaultyStore::default());
        faulty.set_stall_after_claim(true);
        let store = ResilientStore::new(
            faulty.clone(),
            fast_config().with_timeout(Duration::from_millis(50)),
        );

        let err = store.set_if_absent("k", "mine", Duration::from_secs(60)).await.err();
        assert!(matches!(err, Some(StoreError::Timeout(_))));
        // The write landed; a replay would have answered `false`.
        assert_eq!(faulty.inner().get("k").await?.as_deref(), Some("mine"));
        Ok(())
    }

    #[test]
    fn backoff_is_capped_with_bounded_jitter() {
        let config = RetryConfig::default()
            .with_initial_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(40));
        for attempt in 0..8 {
            let delay = config.backoff(attempt);
            assert!(delay <= Duration::from_millis(60));
            assert!(delay >= Duration::from_millis(10));
        }
    }
}
