use crate::{
    auth::{
        cookie::SameSite, rate_limit::FailureMode, rate_limit::RateLimitPolicy, token::ReusePolicy,
        AuthConfig,
    },
    store::RetryConfig,
};
use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::time::Duration;

#[derive(Debug)]
pub struct Options {
    pub frontend_base_url: String,
    pub access_ttl_seconds: u64,
    pub refresh_ttl_seconds: u64,
    pub reuse_policy: ReusePolicy,
    pub cookie_access_name: String,
    pub cookie_access_path: String,
    pub cookie_access_max_age_seconds: Option<u64>,
    pub cookie_refresh_name: String,
    pub cookie_refresh_path: String,
    pub cookie_refresh_max_age_seconds: Option<u64>,
    pub cookie_domain: Option<String>,
    pub cookie_same_site: SameSite,
    pub cookie_secure: Option<bool>,
    pub cookie_http_only: bool,
    pub public_limit: u64,
    pub public_window_seconds: u64,
    pub authenticated_limit: u64,
    pub authenticated_window_seconds: u64,
    pub failure_mode: FailureMode,
    pub trust_forwarded_headers: bool,
    pub store_timeout_ms: u64,
    pub store_max_retries: u32,
    pub inactive_timeout_seconds: u64,
    pub activity_retention_seconds: u64,
}

fn required<T: Clone + Send + Sync + 'static>(matches: &clap::ArgMatches, id: &str) -> Result<T> {
    matches
        .get_one::<T>(id)
        .cloned()
        .ok_or_else(|| anyhow!("missing required argument: --{id}"))
}

impl Options {
    /// # Errors
    /// Returns an error if an argument with a default value is somehow absent.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        Ok(Self {
            frontend_base_url: required(matches, "frontend-base-url")?,
            access_ttl_seconds: required(matches, "access-ttl-seconds")?,
            refresh_ttl_seconds: required(matches, "refresh-ttl-seconds")?,
            reuse_policy: required(matches, "refresh-reuse-policy")?,
            cookie_access_name: required(matches, "cookie-access-name")?,
            cookie_access_path: required(matches, "cookie-access-path")?,
            cookie_access_max_age_seconds: matches
                .get_one::<u64>("cookie-access-max-age-seconds")
                .copied(),
            cookie_refresh_name: required(matches, "cookie-refresh-name")?,
            cookie_refresh_path: required(matches, "cookie-refresh-path")?,
            cookie_refresh_max_age_seconds: matches
                .get_one::<u64>("cookie-refresh-max-age-seconds")
                .copied(),
            cookie_domain: matches.get_one::<String>("cookie-domain").cloned(),
            cookie_same_site: required(matches, "cookie-same-site")?,
            cookie_secure: matches.get_one::<bool>("cookie-secure").copied(),
            cookie_http_only: required(matches, "cookie-http-only")?,
            public_limit: required(matches, "rate-limit-public")?,
            public_window_seconds: required(matches, "rate-limit-public-window-seconds")?,
            authenticated_limit: required(matches, "rate-limit-authenticated")?,
            authenticated_window_seconds: required(
                matches,
                "rate-limit-authenticated-window-seconds",
            )?,
            failure_mode: required(matches, "rate-limit-failure-mode")?,
            trust_forwarded_headers: matches.get_flag("trust-forwarded-headers"),
            store_timeout_ms: required(matches, "store-timeout-ms")?,
            store_max_retries: required(matches, "store-max-retries")?,
            inactive_timeout_seconds: required(matches, "inactive-timeout-seconds")?,
            activity_retention_seconds: required(matches, "activity-retention-seconds")?,
        })
    }

    /// # Errors
    /// Returns an error if a rate limit policy is out of range.
    pub fn into_config(self) -> Result<AuthConfig> {
        let public_limit = RateLimitPolicy::new(
            self.public_limit,
            Duration::from_secs(self.public_window_seconds),
        )?;
        let authenticated_limit = RateLimitPolicy::new(
            self.authenticated_limit,
            Duration::from_secs(self.authenticated_window_seconds),
        )?;

        Ok(AuthConfig::new(self.frontend_base_url)
            .with_access_ttl(Duration::from_secs(self.access_ttl_seconds))
            .with_refresh_ttl(Duration::from_secs(self.refresh_ttl_seconds))
            .with_reuse_policy(self.reuse_policy)
            .with_access_cookie_name(self.cookie_access_name)
            .with_access_cookie_path(self.cookie_access_path)
            .with_access_cookie_max_age(self.cookie_access_max_age_seconds.map(Duration::from_secs))
            .with_refresh_cookie_name(self.cookie_refresh_name)
            .with_refresh_cookie_path(self.cookie_refresh_path)
            .with_refresh_cookie_max_age(self.cookie_refresh_max_age_seconds.map(Duration::from_secs))
            .with_cookie_domain(self.cookie_domain)
            .with_cookie_same_site(self.cookie_same_site)
            .with_cookie_secure(self.cookie_secure)
            .with_cookie_http_only(self.cookie_http_only)
            .with_public_limit(public_limit)
            .with_authenticated_limit(authenticated_limit)
            .with_failure_mode(self.failure_mode)
            .with_trust_forwarded_headers(self.trust_forwarded_headers)
            .with_store_retry(
                RetryConfig::default()
                    .with_timeout(Duration::from_millis(self.store_timeout_ms))
                    .with_max_retries(self.store_max_retries),
            )
            .with_inactive_timeout(Duration::from_secs(self.inactive_timeout_seconds))
            .with_activity_retention(Duration::from_secs(self.activity_retention_seconds)))
    }
}

pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    let command = with_cookie_args(command);
    let command = with_rate_limit_args(command);
    with_store_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("frontend-base-url")
                .long("frontend-base-url")
                .help("Frontend base URL; sets the CORS origin and the cookie Secure default")
                .env("PORTIER_FRONTEND_BASE_URL")
                .default_value("https://portier.dev"),
        )
        .arg(
            Arg::new("access-ttl-seconds")
                .long("access-ttl-seconds")
                .help("Access token lifetime in seconds")
                .env("PORTIER_ACCESS_TTL_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("refresh-ttl-seconds")
                .long("refresh-ttl-seconds")
                .help("Refresh token lifetime in seconds")
                .env("PORTIER_REFRESH_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("refresh-reuse-policy")
                .long("refresh-reuse-policy")
                .help("On replay of a rotated refresh token: revoke-family or reject")
                .env("PORTIER_REFRESH_REUSE_POLICY")
                .default_value("revoke-family")
                .value_parser(|value: &str| value.parse::<ReusePolicy>()),
        )
}

fn with_cookie_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("cookie-access-name")
                .long("cookie-access-name")
                .help("Name of the access token cookie")
                .env("PORTIER_COOKIE_ACCESS_NAME")
                .default_value("portier_access"),
        )
        .arg(
            Arg::new("cookie-access-path")
                .long("cookie-access-path")
                .help("Path attribute of the access token cookie")
                .env("PORTIER_COOKIE_ACCESS_PATH")
                .default_value("/"),
        )
        .arg(
            Arg::new("cookie-access-max-age-seconds")
                .long("cookie-access-max-age-seconds")
                .help("Max-Age of the access token cookie (default: the access token lifetime)")
                .env("PORTIER_COOKIE_ACCESS_MAX_AGE_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("cookie-refresh-name")
                .long("cookie-refresh-name")
                .help("Name of the refresh token cookie")
                .env("PORTIER_COOKIE_REFRESH_NAME")
                .default_value("portier_refresh"),
        )
        .arg(
            Arg::new("cookie-refresh-path")
                .long("cookie-refresh-path")
                .help("Path attribute of the refresh token cookie")
                .env("PORTIER_COOKIE_REFRESH_PATH")
                .default_value("/v1/auth"),
        )
        .arg(
            Arg::new("cookie-refresh-max-age-seconds")
                .long("cookie-refresh-max-age-seconds")
                .help("Max-Age of the refresh token cookie (default: the refresh token lifetime)")
                .env("PORTIER_COOKIE_REFRESH_MAX_AGE_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("cookie-http-only")
                .long("cookie-http-only")
                .help("Set the HttpOnly attribute on the session cookies")
                .env("PORTIER_COOKIE_HTTP_ONLY")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new("cookie-domain")
                .long("cookie-domain")
                .help("Domain attribute for the session cookies (host-only when unset)")
                .env("PORTIER_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new("cookie-same-site")
                .long("cookie-same-site")
                .help("SameSite attribute: strict, lax or none")
                .env("PORTIER_COOKIE_SAME_SITE")
                .default_value("lax")
                .value_parser(|value: &str| value.parse::<SameSite>()),
        )
        .arg(
            Arg::new("cookie-secure")
                .long("cookie-secure")
                .help("Force the Secure attribute on or off (default: on for https frontends)")
                .env("PORTIER_COOKIE_SECURE")
                .value_parser(clap::value_parser!(bool)),
        )
}

fn with_rate_limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("rate-limit-public")
                .long("rate-limit-public")
                .help("Requests per window for login, refresh and other per-IP traffic")
                .env("PORTIER_RATE_LIMIT_PUBLIC")
                .default_value("10")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("rate-limit-public-window-seconds")
                .long("rate-limit-public-window-seconds")
                .help("Public rate limit window in seconds")
                .env("PORTIER_RATE_LIMIT_PUBLIC_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("rate-limit-authenticated")
                .long("rate-limit-authenticated")
                .help("Requests per window for each authenticated principal")
                .env("PORTIER_RATE_LIMIT_AUTHENTICATED")
                .default_value("120")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("rate-limit-authenticated-window-seconds")
                .long("rate-limit-authenticated-window-seconds")
                .help("Authenticated rate limit window in seconds")
                .env("PORTIER_RATE_LIMIT_AUTHENTICATED_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("rate-limit-failure-mode")
                .long("rate-limit-failure-mode")
                .help("Behaviour when the store is unreachable: closed (deny) or open (admit)")
                .env("PORTIER_RATE_LIMIT_FAILURE_MODE")
                .default_value("closed")
                .value_parser(|value: &str| value.parse::<FailureMode>()),
        )
        .arg(
            Arg::new("trust-forwarded-headers")
                .long("trust-forwarded-headers")
                .help("Key clients by X-Forwarded-For / X-Real-IP (only behind a trusted proxy)")
                .env("PORTIER_TRUST_FORWARDED_HEADERS")
                .action(ArgAction::SetTrue),
        )
}

fn with_store_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("store-timeout-ms")
                .long("store-timeout-ms")
                .help("Timeout for each shared store call in milliseconds")
                .env("PORTIER_STORE_TIMEOUT_MS")
                .default_value("250")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("store-max-retries")
                .long("store-max-retries")
                .help("Retries for transient shared store failures")
                .env("PORTIER_STORE_MAX_RETRIES")
                .default_value("2")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("inactive-timeout-seconds")
                .long("inactive-timeout-seconds")
                .help("Seconds since last activity after which a principal counts as offline")
                .env("PORTIER_INACTIVE_TIMEOUT_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("activity-retention-seconds")
                .long("activity-retention-seconds")
                .help("How long last-seen records are kept")
                .env("PORTIER_ACTIVITY_RETENTION_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
