//! Shared key-value store used for revocation entries, rate windows and
//! activity records.
//!
//! Every mutation the auth core needs maps onto one atomic primitive of the
//! backend: [`SharedStore::incr_with_expiry`] for rate windows and
//! [`SharedStore::set_if_absent`] for revocation claims. Callers never
//! read-modify-write from the application side.
//!
//! Implementations:
//! - [`MemoryStore`]: single process, lazily expiring map. Used by tests and
//!   single-node deployments.
//! - [`PgStore`]: Postgres table shared by every service instance.
//! - [`ResilientStore`]: wraps another store with a per-call timeout and
//!   bounded retries on transient errors.

#[cfg(test)]
pub(crate) mod faulty;
mod memory;
mod postgres;
mod resilient;

pub use memory::MemoryStore;
pub use postgres::{spawn_janitor, PgStore};
pub use resilient::{ResilientStore, RetryConfig};

use async_trait::async_trait;
use std::time::Duration;

/// Result of an atomic increment on a windowed counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowCount {
    /// Value after the increment (1 for the first hit of a window).
    pub count: u64,
    /// Time left until the window closes and the counter disappears.
    pub expires_in: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    /// The call never reached the backend.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The connection failed mid-call; the backend may have applied it.
    #[error("store call interrupted: {0}")]
    Interrupted(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Errors worth retrying: the call may succeed if repeated.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Unavailable(_) | Self::Interrupted(_)
        )
    }

    /// True when the failed call may still have been applied, so repeating a
    /// non-idempotent write could apply it twice.
    #[must_use]
    pub fn may_have_applied(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Interrupted(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Returns the value for `key` unless it is absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Stores `value`, replacing any previous entry. `None` keeps it forever.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Stores `value` only when `key` is absent or expired.
    ///
    /// Returns `true` when this call created the entry. Under concurrent
    /// callers for the same key exactly one observes `true`.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Increments the counter at `key`, starting a new window of length
    /// `window` when the key is absent or its previous window has closed.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> StoreResult<WindowCount>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::StoreError;
    use std::time::Duration;

    #[test]
    fn transient_errors_are_timeouts_and_outages() {
        assert!(StoreError::Timeout(Duration::from_millis(10)).is_transient());
        assert!(StoreError::Unavailable("refused".to_string()).is_transient());
        assert!(!StoreError::Backend("syntax".to_string()).is_transient());
        assert!(StoreError::Interrupted("reset".to_string()).is_transient());
    }

    #[test]
    fn only_unsent_calls_are_known_unapplied() {
        assert!(StoreError::Timeout(Duration::from_millis(10)).may_have_applied());
        assert!(StoreError::Interrupted("reset".to_string()).may_have_applied());
        assert!(!StoreError::Unavailable("refused".to_string()).may_have_applied());
    }
}
