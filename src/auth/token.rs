//! Signed session tokens.
//!
//! Flow Overview:
//! 1) `issue` starts a token family and signs an access + refresh pair (HS256).
//! 2) `verify_access` runs signature → claim shape → type → expiry →
//!    revocation (jti, then family). A bad signature never reaches the store.
//! 3) `refresh` claims the presented jti with a conditional set. Exactly one
//!    caller wins the claim and gets a new pair in the same family; a later
//!    presentation of a rotated jti is reuse and, by default, revokes the
//!    whole family. Each claim carries its own nonce, so a claim that was
//!    applied but whose reply was lost is read back as ours, not as reuse.
//! 4) `revoke` / `revoke_family` write revocation entries whose TTL matches
//!    the lifetime they cover, so the store cleans them up on its own.

use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    clock::{Clock, SystemClock},
    error::AuthError,
    principal::{Principal, Role},
};
use crate::store::SharedStore;

pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const MIN_SECRET_LEN: usize = 32;

const REVOKED: &str = "revoked";
const ROTATED: &str = "rotated";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claim set carried by every token. Anything else in the payload is rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    pub typ: TokenKind,
    pub jti: String,
    /// Family id shared by every token descended from one login.
    pub fam: String,
}

#[derive(Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    /// Refresh token lifetime in seconds.
    pub refresh_expires_in: u64,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_expires_in", &self.refresh_expires_in)
            .finish_non_exhaustive()
    }
}

/// What to do when an already rotated refresh token is presented again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReusePolicy {
    /// Revoke every token of the family.
    #[default]
    RevokeFamily,
    /// Reject the request only.
    Reject,
}

impl std::str::FromStr for ReusePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "revoke-family" => Ok(Self::RevokeFamily),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown reuse policy: {other}")),
        }
    }
}

#[must_use]
pub fn jti_key(jti: &str) -> String {
    format!("revoked:jti:{jti}")
}

#[must_use]
pub fn family_key(fam: &str) -> String {
    format!("revoked:family:{fam}")
}

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
    reuse_policy: ReusePolicy,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("reuse_policy", &self.reuse_policy)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// # Errors
    /// Returns an error if `secret` is shorter than [`MIN_SECRET_LEN`] bytes.
    pub fn new(secret: &[u8], store: Arc<dyn SharedStore>) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::Internal(format!(
                "token secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against our own clock.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.required_spec_claims.clear();

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
            reuse_policy: ReusePolicy::default(),
            store,
            clock: Arc::new(SystemClock),
        })
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
    pub fn with_reuse_policy(mut self, policy: ReusePolicy) -> Self {
        self.reuse_policy = policy;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Sign a fresh pair for `subject`, opening a new token family.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    #[instrument(skip(self))]
    pub fn issue(&self, subject: &str, role: Role) -> Result<TokenPair, AuthError> {
        let family = Uuid::new_v4().to_string();
        self.issue_in_family(subject, role, &family)
    }

    fn issue_in_family(&self, subject: &str, role: Role, family: &str) -> Result<TokenPair, AuthError> {
        let now = self.clock.now();
        let access = self.sign(subject, role, family, TokenKind::Access, now)?;
        let refresh = self.sign(subject, role, family, TokenKind::Refresh, now)?;
        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl.as_secs(),
            refresh_expires_in: self.refresh_ttl.as_secs(),
        })
    }

    fn sign(
        &self,
        subject: &str,
        role: Role,
        family: &str,
        kind: TokenKind,
        now: i64,
    ) -> Result<String, AuthError> {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: subject.to_string(),
            role,
            iat: now,
            exp: now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
            typ: kind,
            jti: Uuid::new_v4().to_string(),
            fam: family.to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Internal(format!("failed to sign token: {e}")))
    }

    /// Signature and claim-shape check only. Expiry and revocation are the
    /// caller's business.
    fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| {
                let reason = match err.kind() {
                    ErrorKind::InvalidSignature => "invalid signature".to_string(),
                    ErrorKind::InvalidAlgorithm => "unexpected algorithm".to_string(),
                    ErrorKind::Json(_) => "unexpected claim shape".to_string(),
                    other => format!("{other:?}"),
                };
                AuthError::TokenMalformed(reason)
            })
    }

    /// Seconds `claims` has left, or `TokenExpired`.
    fn remaining(&self, claims: &Claims) -> Result<Duration, AuthError> {
        let left = claims.exp.saturating_sub(self.clock.now());
        if left <= 0 {
            return Err(AuthError::TokenExpired);
        }
        Ok(Duration::from_secs(u64::try_from(left).unwrap_or(0)))
    }

    async fn ensure_not_revoked(&self, claims: &Claims) -> Result<(), AuthError> {
        if self.store.exists(&jti_key(&claims.jti)).await? {
            return Err(AuthError::TokenRevoked);
        }
        if self.store.exists(&family_key(&claims.fam)).await? {
            return Err(AuthError::TokenRevoked);
        }
        Ok(())
    }

    /// Resolve an access token into the principal it was issued for.
    ///
    /// # Errors
    /// Any failure in the check chain; store errors fail closed.
    #[instrument(skip_all)]
    pub async fn verify_access(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = self.decode(token)?;
        if claims.typ != TokenKind::Access {
            return Err(AuthError::TokenMalformed("expected an access token".to_string()));
        }
        self.remaining(&claims)?;
        self.ensure_not_revoked(&claims).await?;
        Ok(Principal {
            id: claims.sub,
            role: claims.role,
            issued_at: claims.iat,
        })
    }

    /// Exchange a refresh token for a new pair in the same family.
    ///
    /// # Errors
    /// The presented token is invalid, expired, revoked or already used.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.decode(refresh_token)?;
        if claims.typ != TokenKind::Refresh {
            return Err(AuthError::TokenMalformed("expected a refresh token".to_string()));
        }
        let remaining = self.remaining(&claims)?;
        if self.store.exists(&family_key(&claims.fam)).await? {
            return Err(AuthError::TokenRevoked);
        }

        let key = jti_key(&claims.jti);
        // Tagged per attempt so a claim whose reply was lost can be recognised.
        let claim = format!("{ROTATED}:{}", Uuid::new_v4());
        let claimed = match self.store.set_if_absent(&key, &claim, remaining).await {
            Ok(created) => created,
            Err(err) if err.may_have_applied() => {
                debug!("refresh claim outcome unknown, reading it back: {err}");
                if self.store.get(&key).await?.as_deref() == Some(claim.as_str()) {
                    true
                } else {
                    return Err(err.into());
                }
            }
            Err(err) => return Err(err.into()),
        };

        if !claimed {
            let marker = self.store.get(&key).await?;
            match marker.as_deref() {
                Some(value) if value == claim => {}
                Some(value) if value.starts_with(ROTATED) => {
                    warn!(
                        subject = %claims.sub,
                        family = %claims.fam,
                        "refresh token reuse detected"
                    );
                    if self.reuse_policy == ReusePolicy::RevokeFamily {
                        self.store
                            .set(&family_key(&claims.fam), REVOKED, Some(self.refresh_ttl))
                            .await?;
                    }
                    return Err(AuthError::TokenRevoked);
                }
                _ => return Err(AuthError::TokenRevoked),
            }
        }

        debug!(family = %claims.fam, "refresh token rotated");
        self.issue_in_family(&claims.sub, claims.role, &claims.fam)
    }

    /// Revoke one token until it would have expired anyway.
    ///
    /// # Errors
    /// The token does not verify, or the store write fails.
    #[instrument(skip_all)]
    pub async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.decode(token)?;
        let remaining = match self.remaining(&claims) {
            Ok(remaining) => remaining,
            Err(AuthError::TokenExpired) => return Ok(()),
            Err(err) => return Err(err),
        };
        self.store
            .set(&jti_key(&claims.jti), REVOKED, Some(remaining))
            .await?;
        Ok(())
    }

    /// Revoke every token that shares `token`'s family.
    ///
    /// # Errors
    /// The token does not verify, or the store write fails.
    #[instrument(skip_all)]
    pub async fn revoke_family(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.decode(token)?;
        self.store
            .set(&family_key(&claims.fam), REVOKED, Some(self.refresh_ttl))
            .await?;
        Ok(())
    }

    /// Subject of a correctly signed, unexpired access token, without
    /// touching the store. Revocation is not checked here.
    #[must_use]
    pub fn decode_subject(&self, token: &str) -> Option<String> {
        let claims = self.decode(token).ok()?;
        if claims.typ != TokenKind::Access || self.remaining(&claims).is_err() {
            return None;
        }
        Some(claims.sub)
    }
}
