//! Request verification as an ordered list of stages.
//!
//! Flow Overview (protected routes):
//! 1) `RateLimit`: key the request by the subject of a correctly signed,
//!    unexpired access token, or by client IP on the public tier, and consult
//!    the limiter before any store lookup for the credential.
//! 2) `ExtractCredentials`: bearer header first, then the access cookie,
//!    structurally decoded.
//! 3) `VerifyToken`: full access-token verification, revocation included.
//! 4) `AttachPrincipal`: the principal goes into request extensions, where the
//!    `Authenticated` extractor finds it.
//! 5) `TrackActivity`: fire-and-forget last-seen update.
//!
//! Public routes (login, refresh) run only the rate-limit stage, keyed by IP
//! on the public tier.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tracing::debug;

use super::{
    cookie::CookieTransport,
    error::AuthError,
    principal::Principal,
    rate_limit::{ClientKey, RateLimitDecision, RateLimitTier},
    state::AuthState,
};

pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    RateLimit,
    ExtractCredentials,
    VerifyToken,
    AttachPrincipal,
    TrackActivity,
}

/// How the rate-limit stage picks its key and tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keying {
    /// Principal id on the authenticated tier when a signed token is
    /// presented, client IP on the public tier otherwise.
    PrincipalOrIp,
    /// Always client IP on the public tier.
    IpOnly,
}

#[derive(Clone, Copy, Debug)]
pub struct Pipeline {
    pub stages: &'static [Stage],
    pub keying: Keying,
}

pub const PROTECTED: Pipeline = Pipeline {
    stages: &[
        Stage::RateLimit,
        Stage::ExtractCredentials,
        Stage::VerifyToken,
        Stage::AttachPrincipal,
        Stage::TrackActivity,
    ],
    keying: Keying::PrincipalOrIp,
};

pub const PUBLIC: Pipeline = Pipeline {
    stages: &[Stage::RateLimit],
    keying: Keying::IpOnly,
};

/// State threaded through the stages of one request.
#[derive(Debug, Default)]
pub struct RequestContext {
    pub client: Option<ClientKey>,
    pub remaining: Option<u64>,
    pub token: Option<String>,
    pub principal: Option<Principal>,
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Bearer header first, then the access cookie.
#[must_use]
pub fn presented_token(state: &AuthState, headers: &HeaderMap) -> Option<String> {
    extract_bearer_token(headers).or_else(|| state.access_cookie().extract(headers))
}

/// Client address for rate limiting. Proxy headers are only honoured when
/// the deployment says a trusted proxy sets them.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> Option<IpAddr> {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|value| value.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<IpAddr>().ok());
        if real_ip.is_some() {
            return real_ip;
        }
    }
    peer.map(|addr| addr.ip())
}

fn ip_key(state: &AuthState, request: &Request) -> ClientKey {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    client_ip(
        request.headers(),
        peer,
        state.config().trust_forwarded_headers(),
    )
    .map_or(ClientKey::Unknown, ClientKey::Ip)
}

fn out_of_order(stage: Stage) -> AuthError {
    AuthError::Internal(format!("auth stage {stage:?} ran before its inputs were ready"))
}

async fn run_stage(
    stage: Stage,
    keying: Keying,
    ctx: &mut RequestContext,
    state: &AuthState,
    request: &mut Request,
) -> Result<(), AuthError> {
    match stage {
        Stage::RateLimit => {
            let subject = match keying {
                Keying::PrincipalOrIp => presented_token(state, request.headers())
                    .and_then(|token| state.tokens().decode_subject(&token)),
                Keying::IpOnly => None,
            };
            let (tier, client) = match subject {
                Some(subject) => (RateLimitTier::Authenticated, ClientKey::Principal(subject)),
                None => (RateLimitTier::Public, ip_key(state, request)),
            };
            match state.rate_limiter().allow(tier, &client).await? {
                RateLimitDecision::Allowed { remaining } => ctx.remaining = Some(remaining),
                RateLimitDecision::Denied { retry_after } => {
                    return Err(AuthError::RateLimitExceeded { retry_after });
                }
            }
            ctx.client = Some(client);
        }
        Stage::ExtractCredentials => {
            let raw = presented_token(state, request.headers()).ok_or(AuthError::TokenMissing)?;
            ctx.token = Some(CookieTransport::decode(&raw)?);
        }
        Stage::VerifyToken => {
            let token = ctx.token.as_deref().ok_or_else(|| out_of_order(stage))?;
            ctx.principal = Some(state.tokens().verify_access(token).await?);
        }
        Stage::AttachPrincipal => {
            let principal = ctx.principal.clone().ok_or_else(|| out_of_order(stage))?;
            request.extensions_mut().insert(principal);
        }
        Stage::TrackActivity => {
            let principal = ctx.principal.as_ref().ok_or_else(|| out_of_order(stage))?;
            state.activity().touch(&principal.id);
        }
    }
    Ok(())
}

/// Run `pipeline` over `request`, stopping at the first failing stage.
///
/// # Errors
/// The error of the stage that short-circuited.
pub async fn run_pipeline(
    pipeline: Pipeline,
    state: &AuthState,
    request: &mut Request,
) -> Result<RequestContext, AuthError> {
    let mut ctx = RequestContext::default();
    for &stage in pipeline.stages {
        if let Err(err) = run_stage(stage, pipeline.keying, &mut ctx, state, request).await {
            debug!(?stage, client = ?ctx.client, "auth pipeline stopped: {err}");
            return Err(err);
        }
    }
    Ok(ctx)
}

async fn guard(pipeline: Pipeline, state: &AuthState, mut request: Request, next: Next) -> Response {
    let ctx = match run_pipeline(pipeline, state, &mut request).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    let mut response = next.run(request).await;
    if let Some(remaining) = ctx.remaining {
        response
            .headers_mut()
            .insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    }
    response
}

/// Middleware for routes that need a verified principal.
pub async fn require_auth(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    guard(PROTECTED, &state, request, next).await
}

/// Middleware for login and refresh: rate limit by IP only.
pub async fn public_rate_limit(
    State(state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Response {
    guard(PUBLIC, &state, request, next).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{
            clock::{Clock, ManualClock, SystemClock},
            principal::{MemoryDirectory, Role},
            rate_limit::RateLimitPolicy,
            state::AuthConfig,
        },
        store::MemoryStore,
    };
    use anyhow::Result;
    use axum::body::Body;
    use secrecy::SecretString;
    use std::time::Duration;

    fn state(limit: u64) -> Result<AuthState> {
        state_with_clock(limit, Arc::new(SystemClock))
    }

    fn state_with_clock(limit: u64, clock: Arc<dyn Clock>) -> Result<AuthState> {
        let config = AuthConfig::new("http://localhost".to_string())
            .with_public_limit(RateLimitPolicy::new(limit, Duration::from_secs(60))?)
            .with_authenticated_limit(RateLimitPolicy::new(limit, Duration::from_secs(60))?)
            .with_trust_forwarded_headers(true);
        let (state, _worker) = AuthState::new(
            config,
            &SecretString::from("0123456789abcdef0123456789abcdef"),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryDirectory::new()),
            clock,
        )?;
        Ok(state)
    }

    fn request(headers: &[(&str, &str)]) -> Result<Request> {
        let mut builder = Request::builder().uri("/v1/auth/session");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        Ok(builder.body(Body::empty())?)
    }

    #[test]
    fn protected_pipeline_rate_limits_first() {
        assert_eq!(PROTECTED.stages.first(), Some(&Stage::RateLimit));
        assert_eq!(PROTECTED.stages.last(), Some(&Stage::TrackActivity));
        assert_eq!(PUBLIC.stages, &[Stage::RateLimit]);
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn forwarded_headers_need_trust() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        let peer: SocketAddr = ([192, 0, 2, 1], 4000).into();

        assert_eq!(
            client_ip(&headers, Some(peer), true),
            Some(IpAddr::from([203, 0, 113, 9]))
        );
        assert_eq!(
            client_ip(&headers, Some(peer), false),
            Some(IpAddr::from([192, 0, 2, 1]))
        );
        headers.clear();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(
            client_ip(&headers, None, true),
            Some(IpAddr::from([198, 51, 100, 4]))
        );
        assert_eq!(client_ip(&HeaderMap::new(), None, true), None);
    }

    #[tokio::test]
    async fn valid_bearer_attaches_principal() -> Result<()> {
        let state = state(10)?;
        let pair = state.tokens().issue("alice", Role::User)?;
        let bearer = format!("Bearer {}", pair.access_token);
        let mut request = request(&[("authorization", bearer.as_str())])?;

        let ctx = run_pipeline(PROTECTED, &state, &mut request).await?;
        assert_eq!(ctx.client, Some(ClientKey::Principal("alice".to_string())));
        assert_eq!(ctx.remaining, Some(9));
        let attached = request.extensions().get::<Principal>().map(|p| p.id.clone());
        assert_eq!(attached.as_deref(), Some("alice"));
        Ok(())
    }

    #[tokio::test]
    async fn access_cookie_is_accepted() -> Result<()> {
        let state = state(10)?;
        let pair = state.tokens().issue("bob", Role::User)?;
        let cookie = format!("portier_access={}", pair.access_token);
        let mut request = request(&[("cookie", cookie.as_str())])?;
        let ctx = run_pipeline(PROTECTED, &state, &mut request).await?;
        assert_eq!(ctx.principal.map(|p| p.id).as_deref(), Some("bob"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_token_is_rejected_after_rate_limit() -> Result<()> {
        let state = state(1)?;
        let headers = [("x-forwarded-for", "203.0.113.9")];

        let first = run_pipeline(PROTECTED, &state, &mut request(&headers)?).await;
        assert!(matches!(first, Err(AuthError::TokenMissing)));

        let second = run_pipeline(PROTECTED, &state, &mut request(&headers)?).await;
        assert!(matches!(second, Err(AuthError::RateLimitExceeded { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn garbage_cookie_is_malformed() -> Result<()> {
        let state = state(10)?;
        let mut request = request(&[("cookie", "portier_access=not-a-token")])?;
        let result = run_pipeline(PROTECTED, &state, &mut request).await;
        assert!(matches!(result, Err(AuthError::TokenMalformed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn public_pipeline_ignores_tokens_for_keying() -> Result<()> {
        let state = state(10)?;
        let pair = state.tokens().issue("alice", Role::User)?;
        let bearer = format!("Bearer {}", pair.access_token);
        let mut request = request(&[
            ("authorization", bearer.as_str()),
            ("x-forwarded-for", "203.0.113.9"),
        ])?;
        let ctx = run_pipeline(PUBLIC, &state, &mut request).await?;
        assert_eq!(ctx.client, Some(ClientKey::Ip(IpAddr::from([203, 0, 113, 9]))));
        assert!(request.extensions().get::<Principal>().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn stale_tokens_do_not_spend_the_owners_budget() -> Result<()> {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let state = state_with_clock(2, clock.clone())?;
        let stale = state.tokens().issue("victim", Role::User)?;
        clock.advance(1800);
        let fresh = state.tokens().issue("victim", Role::User)?;

        let expired = format!("Bearer {}", stale.access_token);
        for _ in 0..2 {
            let mut request = request(&[
                ("authorization", expired.as_str()),
                ("x-forwarded-for", "203.0.113.9"),
            ])?;
            let result = run_pipeline(PROTECTED, &state, &mut request).await;
            assert!(matches!(result, Err(AuthError::TokenExpired)));
        }

        // Refresh tokens are not keyed to their subject either.
        let refresh = format!("Bearer {}", fresh.refresh_token);
        let mut request = request(&[
            ("authorization", refresh.as_str()),
            ("x-forwarded-for", "203.0.113.10"),
        ])?;
        let _ = run_pipeline(PROTECTED, &state, &mut request).await;

        let bearer = format!("Bearer {}", fresh.access_token);
        let mut request = self::request(&[("authorization", bearer.as_str())])?;
        let ctx = run_pipeline(PROTECTED, &state, &mut request).await?;
        assert_eq!(ctx.client, Some(ClientKey::Principal("victim".to_string())));
        assert_eq!(ctx.remaining, Some(1));
        Ok(())
    }
}
