//! Login, refresh, logout and session endpoints.
//!
//! Tokens are returned both in the JSON body and as cookies: browsers use the
//! cookies, other clients the bearer header.

use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

use crate::auth::{
    middleware::presented_token,
    principal::Account,
    token::TokenPair,
    AuthError, AuthState, Authenticated,
};

#[derive(ToSchema, Deserialize)]
pub struct LoginRequest {
    /// Username or email.
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(ToSchema, Deserialize, Default)]
pub struct RefreshRequest {
    /// Falls back to the refresh cookie when absent.
    pub refresh_token: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SessionResponse {
    pub principal_id: String,
    pub role: String,
    pub issued_at: i64,
    pub last_seen: Option<i64>,
}

fn token_response(state: &AuthState, status: StatusCode, pair: TokenPair) -> Response {
    let mut headers = HeaderMap::new();
    let cookies = state
        .access_cookie()
        .set_on(&mut headers, &pair.access_token)
        .and_then(|()| state.refresh_cookie().set_on(&mut headers, &pair.refresh_token));
    if let Err(err) = cookies {
        return err.into_response();
    }
    (status, headers, Json(pair)).into_response()
}

fn clear_cookies(state: &AuthState) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for cookie in [state.access_cookie(), state.refresh_cookie()] {
        match cookie.clear() {
            Ok(value) => {
                headers.append(SET_COOKIE, value);
            }
            Err(err) => error!("Failed to build cookie: {err}"),
        }
    }
    headers
}

async fn authenticate(state: &AuthState, request: LoginRequest) -> Result<Account, AuthError> {
    let account = state
        .directory()
        .find_by_identifier(request.username.trim())
        .await
        .map_err(|err| AuthError::Internal(format!("principal lookup failed: {err:#}")))?;

    let credential = account.as_ref().map(|account| account.credential.clone());
    let verified = state
        .hasher()
        .verify_async(request.password, credential)
        .await?;

    match account {
        Some(account) if verified && account.active => Ok(account),
        Some(account) if verified => {
            debug!(principal = %account.principal_id, "login for inactive account");
            Err(AuthError::InvalidCredential)
        }
        _ => Err(AuthError::InvalidCredential),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = TokenPair),
        (status = 401, description = "Invalid credentials"),
        (status = 429, description = "Too many requests")
    ),
    tag = "auth"
)]
#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };
    let password = request.password.clone();

    let account = match authenticate(&state, request).await {
        Ok(account) => account,
        Err(err) => return err.into_response(),
    };

    if state.hasher().needs_rehash(&account.credential) {
        match state.hasher().hash_async(password).await {
            Ok(upgraded) => {
                if let Err(err) = state
                    .directory()
                    .replace_credential(&account.principal_id, &upgraded)
                    .await
                {
                    warn!("Failed to upgrade credential: {err:#}");
                }
            }
            Err(err) => warn!("Failed to rehash credential: {err}"),
        }
    }

    match state.tokens().issue(&account.principal_id, account.role) {
        Ok(pair) => {
            info!(principal = %account.principal_id, "login succeeded");
            token_response(&state, StatusCode::OK, pair)
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body(content = RefreshRequest, description = "Optional; the refresh cookie is used otherwise"),
    responses(
        (status = 200, description = "New token pair", body = TokenPair),
        (status = 401, description = "Refresh token invalid, expired or already used"),
        (status = 429, description = "Too many requests")
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn refresh(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
    payload: Option<Json<RefreshRequest>>,
) -> Response {
    let from_body = payload.and_then(|Json(request)| request.refresh_token);
    let Some(token) = from_body.or_else(|| state.refresh_cookie().extract(&headers)) else {
        return AuthError::TokenMissing.into_response();
    };

    match state.tokens().refresh(&token).await {
        Ok(pair) => token_response(&state, StatusCode::OK, pair),
        Err(err) if err.is_unauthenticated() => {
            // Drop stale cookies so the browser stops presenting them.
            let headers = clear_cookies(&state);
            (headers, err).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session revoked and cookies cleared"),
        (status = 503, description = "Revocation could not be recorded")
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn logout(State(state): State<Arc<AuthState>>, headers: HeaderMap) -> Response {
    let token = state
        .refresh_cookie()
        .extract(&headers)
        .or_else(|| presented_token(&state, &headers));

    if let Some(token) = token {
        match state.tokens().revoke_family(&token).await {
            Ok(()) => debug!("session family revoked"),
            Err(err @ AuthError::StoreUnavailable(_)) => return err.into_response(),
            Err(err) => debug!("logout with unusable token: {err}"),
        }
    }

    // Always clear the cookies, even without a usable token.
    (StatusCode::NO_CONTENT, clear_cookies(&state)).into_response()
}

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Session is active", body = SessionResponse),
        (status = 401, description = "Not authenticated")
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn session(
    State(state): State<Arc<AuthState>>,
    Authenticated(principal): Authenticated,
) -> impl IntoResponse {
    let last_seen = match state.activity().last_seen(&principal.id).await {
        Ok(last_seen) => last_seen,
        Err(err) => {
            error!("Failed to read activity: {err}");
            None
        }
    };
    Json(SessionResponse {
        principal_id: principal.id,
        role: principal.role.as_str().to_string(),
        issued_at: principal.issued_at,
        last_seen,
    })
}
