//! Auth configuration and the shared state handed to handlers and middleware.

use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

use super::{
    activity::{ActivityTracker, DEFAULT_INACTIVE_TIMEOUT, DEFAULT_QUEUE_CAPACITY, DEFAULT_RETENTION},
    clock::Clock,
    cookie::{
        secure_by_default, CookieConfig, CookieTransport, SameSite, ACCESS_COOKIE_NAME,
        ACCESS_COOKIE_PATH, REFRESH_COOKIE_NAME, REFRESH_COOKIE_PATH,
    },
    error::AuthError,
    password::CredentialHasher,
    principal::PrincipalDirectory,
    rate_limit::{
        FailureMode, RateLimitPolicy, RateLimiter, StoreRateLimiter, DEFAULT_AUTHENTICATED_POLICY,
        DEFAULT_PUBLIC_POLICY,
    },
    token::{ReusePolicy, TokenService, DEFAULT_ACCESS_TTL, DEFAULT_REFRESH_TTL},
};
use crate::store::{ResilientStore, RetryConfig, SharedStore};

#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    public_limit: RateLimitPolicy,
    authenticated_limit: RateLimitPolicy,
    failure_mode: FailureMode,
    reuse_policy: ReusePolicy,
    access_cookie_name: String,
    access_cookie_path: String,
    access_cookie_max_age: Option<Duration>,
    refresh_cookie_name: String,
    refresh_cookie_path: String,
    refresh_cookie_max_age: Option<Duration>,
    cookie_domain: Option<String>,
    cookie_same_site: SameSite,
    cookie_secure: Option<bool>,
    cookie_http_only: bool,
    trust_forwarded_headers: bool,
    store_retry: RetryConfig,
    activity_retention: Duration,
    inactive_timeout: Duration,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url,
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
            public_limit: DEFAULT_PUBLIC_POLICY,
            authenticated_limit: DEFAULT_AUTHENTICATED_POLICY,
            failure_mode: FailureMode::default(),
            reuse_policy: ReusePolicy::default(),
            access_cookie_name: ACCESS_COOKIE_NAME.to_string(),
            access_cookie_path: ACCESS_COOKIE_PATH.to_string(),
            access_cookie_max_age: None,
            refresh_cookie_name: REFRESH_COOKIE_NAME.to_string(),
            refresh_cookie_path: REFRESH_COOKIE_PATH.to_string(),
            refresh_cookie_max_age: None,
            cookie_domain: None,
            cookie_same_site: SameSite::default(),
            cookie_secure: None,
            cookie_http_only: true,
            trust_forwarded_headers: false,
            store_retry: RetryConfig::default(),
            activity_retention: DEFAULT_RETENTION,
            inactive_timeout: DEFAULT_INACTIVE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_public_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.public_limit = policy;
        self
    }

    #[must_use]
    pub fn with_authenticated_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.authenticated_limit = policy;
        self
    }

    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    #[must_use]
    pub fn with_reuse_policy(mut self, policy: ReusePolicy) -> Self {
        self.reuse_policy = policy;
        self
    }

    #[must_use]
    pub fn with_access_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.access_cookie_name = name.into();
        self
    }

    #[must_use]
    pub fn with_access_cookie_path(mut self, path: impl Into<String>) -> Self {
        self.access_cookie_path = path.into();
        self
    }

    /// Cookie `Max-Age`; defaults to the access token lifetime.
    #[must_use]
    pub fn with_access_cookie_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.access_cookie_max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_refresh_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.refresh_cookie_name = name.into();
        self
    }

    #[must_use]
    pub fn with_refresh_cookie_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_cookie_path = path.into();
        self
    }

    /// Cookie `Max-Age`; defaults to the refresh token lifetime.
    #[must_use]
    pub fn with_refresh_cookie_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.refresh_cookie_max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_cookie_http_only(mut self, http_only: bool) -> Self {
        self.cookie_http_only = http_only;
        self
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain;
        self
    }

    #[must_use]
    pub fn with_cookie_same_site(mut self, same_site: SameSite) -> Self {
        self.cookie_same_site = same_site;
        self
    }

    /// Override the `Secure` attribute; by default it follows the front-end scheme.
    #[must_use]
    pub fn with_cookie_secure(mut self, secure: Option<bool>) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn with_trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    #[must_use]
    pub fn with_store_retry(mut self, retry: RetryConfig) -> Self {
        self.store_retry = retry;
        self
    }

    #[must_use]
    pub fn with_activity_retention(mut self, retention: Duration) -> Self {
        self.activity_retention = retention;
        self
    }

    #[must_use]
    pub fn with_inactive_timeout(mut self, timeout: Duration) -> Self {
        self.inactive_timeout = timeout;
        self
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    #[must_use]
    pub fn trust_forwarded_headers(&self) -> bool {
        self.trust_forwarded_headers
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
            .unwrap_or_else(|| secure_by_default(&self.frontend_base_url))
    }

    fn cookie(&self, base: CookieConfig) -> Result<CookieTransport, AuthError> {
        CookieTransport::new(
            base.with_domain(self.cookie_domain.clone())
                .with_http_only(self.cookie_http_only)
                .with_same_site(self.cookie_same_site)
                .with_secure(self.cookie_secure()),
        )
    }

    fn access_cookie(&self) -> Result<CookieTransport, AuthError> {
        self.cookie(
            CookieConfig::access(self.access_cookie_max_age.unwrap_or(self.access_ttl))
                .with_name(self.access_cookie_name.clone())
                .with_path(self.access_cookie_path.clone()),
        )
    }

    fn refresh_cookie(&self) -> Result<CookieTransport, AuthError> {
        if self.refresh_cookie_name == self.access_cookie_name {
            return Err(AuthError::Internal(format!(
                "access and refresh cookies share the name {:?}",
                self.refresh_cookie_name
            )));
        }
        self.cookie(
            CookieConfig::refresh(self.refresh_cookie_max_age.unwrap_or(self.refresh_ttl))
                .with_name(self.refresh_cookie_name.clone())
                .with_path(self.refresh_cookie_path.clone()),
        )
    }
}

/// Everything the auth endpoints and middleware need, shared behind an `Arc`.
pub struct AuthState {
    config: AuthConfig,
    tokens: TokenService,
    rate_limiter: Arc<dyn RateLimiter>,
    access_cookie: CookieTransport,
    refresh_cookie: CookieTransport,
    activity: ActivityTracker,
    hasher: CredentialHasher,
    directory: Arc<dyn PrincipalDirectory>,
    store: Arc<dyn SharedStore>,
}

impl AuthState {
    /// Wire the auth core over `store`. Every store call goes through a
    /// timeout/retry wrapper built from the config.
    ///
    /// Returns the state and the activity worker handle.
    ///
    /// # Errors
    /// Returns an error if the secret is too short or a cookie attribute is invalid.
    pub fn new(
        config: AuthConfig,
        secret: &SecretString,
        store: Arc<dyn SharedStore>,
        directory: Arc<dyn PrincipalDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, JoinHandle<()>), AuthError> {
        let store: Arc<dyn SharedStore> = Arc::new(ResilientStore::new(store, config.store_retry));

        let tokens = TokenService::new(secret.expose_secret().as_bytes(), store.clone())?
            .with_access_ttl(config.access_ttl)
            .with_refresh_ttl(config.refresh_ttl)
            .with_reuse_policy(config.reuse_policy)
            .with_clock(clock.clone());

        let rate_limiter = StoreRateLimiter::new(
            store.clone(),
            config.public_limit,
            config.authenticated_limit,
        )
        .with_failure_mode(config.failure_mode);

        let access_cookie = config.access_cookie()?;
        let refresh_cookie = config.refresh_cookie()?;

        let (activity, worker) = ActivityTracker::spawn(
            store.clone(),
            clock,
            DEFAULT_QUEUE_CAPACITY,
            config.activity_retention,
        );
        let activity = activity.with_inactive_timeout(config.inactive_timeout);

        Ok((
            Self {
                config,
                tokens,
                rate_limiter: Arc::new(rate_limiter),
                access_cookie,
                refresh_cookie,
                activity,
                hasher: CredentialHasher::default(),
                directory,
                store,
            },
            worker,
        ))
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    #[must_use]
    pub fn with_hasher(mut self, hasher: CredentialHasher) -> Self {
        self.hasher = hasher;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    #[must_use]
    pub fn access_cookie(&self) -> &CookieTransport {
        &self.access_cookie
    }

    #[must_use]
    pub fn refresh_cookie(&self) -> &CookieTransport {
        &self.refresh_cookie
    }

    #[must_use]
    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    #[must_use]
    pub fn hasher(&self) -> &CredentialHasher {
        &self.hasher
    }

    #[must_use]
    pub fn directory(&self) -> &dyn PrincipalDirectory {
        self.directory.as_ref()
    }

    /// The shared store, behind the timeout/retry wrapper.
    #[must_use]
    pub fn store(&self) -> &dyn SharedStore {
        self.store.as_ref()
    }
}
