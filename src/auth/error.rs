//! Auth failure taxonomy and its HTTP mapping.
//!
//! Credential and token failures all collapse into the same 401 body so a
//! caller cannot tell an expired token from a forged one; the precise reason
//! is only visible in the logs.

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("token missing")]
    TokenMissing,
    #[error("token expired")]
    TokenExpired,
    #[error("token revoked")]
    TokenRevoked,
    #[error("token malformed: {0}")]
    TokenMalformed(String),
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// True for every failure that must look like a plain 401 to the client.
    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential
                | Self::TokenMissing
                | Self::TokenExpired
                | Self::TokenRevoked
                | Self::TokenMalformed(_)
        )
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Whole seconds for a `Retry-After` header, never below one.
#[must_use]
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            err if err.is_unauthenticated() => debug!("request rejected: {err}"),
            Self::RateLimitExceeded { .. } => debug!("{self}"),
            Self::StoreUnavailable(err) => warn!("auth store unavailable: {err}"),
            _ => error!("{self}"),
        }

        let message = match &self {
            err if err.is_unauthenticated() => "unauthenticated",
            Self::RateLimitExceeded { .. } => "too many requests",
            Self::StoreUnavailable(_) => "service unavailable",
            _ => "internal error",
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if let Self::RateLimitExceeded { retry_after } = self {
            response.headers_mut().insert(
                RETRY_AFTER,
                HeaderValue::from(retry_after_secs(retry_after)),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::body::to_bytes;

    async fn body_of(err: AuthError) -> Result<(StatusCode, serde_json::Value, Response)> {
        let response = err.into_response();
        let status = response.status();
        let (parts, body) = response.into_parts();
        let bytes = to_bytes(body, usize::MAX).await?;
        let value = serde_json::from_slice(&bytes)?;
        Ok((status, value, Response::from_parts(parts, axum::body::Body::empty())))
    }

    #[tokio::test]
    async fn token_failures_are_indistinguishable() -> Result<()> {
        let variants = [
            AuthError::InvalidCredential,
            AuthError::TokenMissing,
            AuthError::TokenExpired,
            AuthError::TokenRevoked,
            AuthError::TokenMalformed("bad signature".to_string()),
        ];
        for err in variants {
            let (status, body, _) = body_of(err).await?;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, json!({ "error": "unauthenticated" }));
        }
        Ok(())
    }

    #[tokio::test]
    async fn rate_limit_sets_retry_after() -> Result<()> {
        let err = AuthError::RateLimitExceeded {
            retry_after: Duration::from_millis(1500),
        };
        let (status, _, response) = body_of(err).await?;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER).map(HeaderValue::as_bytes),
            Some(&b"2"[..])
        );
        Ok(())
    }

    #[tokio::test]
    async fn store_outage_is_503() -> Result<()> {
        let err = AuthError::from(StoreError::Timeout(Duration::from_millis(250)));
        let (status, body, _) = body_of(err).await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({ "error": "service unavailable" }));
        Ok(())
    }

    #[test]
    fn retry_after_never_rounds_to_zero() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(3)), 3);
    }
}
