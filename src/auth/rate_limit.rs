//! Per-client request limits.
//!
//! Fixed windows counted in the shared store: one atomic
//! increment-with-expiry per decision, so every instance sees the same count
//! and exactly `limit` requests get through per window.

use async_trait::async_trait;
use std::{fmt, net::IpAddr, sync::Arc, time::Duration};
use tracing::{debug, warn};

use super::error::AuthError;
use crate::store::SharedStore;

const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    limit: u64,
    window: Duration,
}

/// 10 requests per minute per IP.
pub const DEFAULT_PUBLIC_POLICY: RateLimitPolicy = RateLimitPolicy {
    limit: 10,
    window: Duration::from_secs(60),
};

/// 120 requests per minute per principal.
pub const DEFAULT_AUTHENTICATED_POLICY: RateLimitPolicy = RateLimitPolicy {
    limit: 120,
    window: Duration::from_secs(60),
};

impl RateLimitPolicy {
    /// # Errors
    /// Returns an error if `limit` is zero or `window` is shorter than one second.
    pub fn new(limit: u64, window: Duration) -> Result<Self, AuthError> {
        if limit == 0 {
            return Err(AuthError::Internal("rate limit must be at least 1".to_string()));
        }
        if window < Duration::from_secs(1) {
            return Err(AuthError::Internal(format!(
                "rate limit window must be at least 1s, got {window:?}"
            )));
        }
        Ok(Self { limit, window })
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitTier {
    /// Unauthenticated traffic and the login/refresh endpoints.
    Public,
    Authenticated,
}

impl RateLimitTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Authenticated => "authenticated",
        }
    }
}

/// Who a request is counted against.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClientKey {
    Principal(String),
    Ip(IpAddr),
    /// No identity and no address; all such requests share one bucket.
    Unknown,
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Principal(id) => write!(f, "principal:{id}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u64 },
    Denied { retry_after: Duration },
}

/// Behaviour when the store cannot be reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Admit the request.
    Open,
    /// Refuse the request with `StoreUnavailable`.
    #[default]
    Closed,
}

impl std::str::FromStr for FailureMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown failure mode: {other}")),
        }
    }
}

#[must_use]
pub fn window_key(tier: RateLimitTier, client: &ClientKey) -> String {
    format!("ratelimit:{}:{client}", tier.as_str())
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(
        &self,
        tier: RateLimitTier,
        client: &ClientKey,
    ) -> Result<RateLimitDecision, AuthError>;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn allow(
        &self,
        _tier: RateLimitTier,
        _client: &ClientKey,
    ) -> Result<RateLimitDecision, AuthError> {
        Ok(RateLimitDecision::Allowed {
            remaining: u64::MAX,
        })
    }
}

pub struct StoreRateLimiter {
    store: Arc<dyn SharedStore>,
    public: RateLimitPolicy,
    authenticated: RateLimitPolicy,
    failure_mode: FailureMode,
}

impl StoreRateLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn SharedStore>,
        public: RateLimitPolicy,
        authenticated: RateLimitPolicy,
    ) -> Self {
        Self {
            store,
            public,
            authenticated,
            failure_mode: FailureMode::default(),
        }
    }

    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    fn policy(&self, tier: RateLimitTier) -> RateLimitPolicy {
        match tier {
            RateLimitTier::Public => self.public,
            RateLimitTier::Authenticated => self.authenticated,
        }
    }
}

#[async_trait]
impl RateLimiter for StoreRateLimiter {
    async fn allow(
        &self,
        tier: RateLimitTier,
        client: &ClientKey,
    ) -> Result<RateLimitDecision, AuthError> {
        let policy = self.policy(tier);
        let key = window_key(tier, client);

        let window = match self.store.incr_with_expiry(&key, policy.window).await {
            Ok(window) => window,
            Err(err) => {
                return match self.failure_mode {
                    FailureMode::Closed => Err(AuthError::StoreUnavailable(err)),
                    FailureMode::Open => {
                        warn!(tier = tier.as_str(), "rate limiter failing open: {err}");
                        Ok(RateLimitDecision::Allowed {
                            remaining: policy.limit,
                        })
                    }
                };
            }
        };

        if window.count <= policy.limit {
            return Ok(RateLimitDecision::Allowed {
                remaining: policy.limit - window.count,
            });
        }

        debug!(tier = tier.as_str(), %client, count = window.count, "rate limit exceeded");
        Ok(RateLimitDecision::Denied {
            retry_after: window.expires_in.max(MIN_RETRY_AFTER),
        })
    }
}
