//! Authenticated identity and the account lookup collaborator.
//!
//! Flow Overview: login resolves an identifier (username first, then email)
//! through a [`PrincipalDirectory`], checks the stored credential, and turns
//! the account into a [`Principal`] that is carried inside tokens. Handlers
//! behind the protected pipeline read it back with [`Authenticated`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::Instrument;

use super::{error::AuthError, password::Credential};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    /// Unknown role names map to the least privileged role.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("admin") {
            Self::Admin
        } else {
            Self::User
        }
    }
}

/// Verified identity attached to a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    /// Unix seconds at which the presented token was issued.
    pub issued_at: i64,
}

/// Extractor for handlers behind the protected pipeline.
#[derive(Clone, Debug)]
pub struct Authenticated(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(Self)
            .ok_or(AuthError::TokenMissing)
    }
}

/// An account as seen by the login flow.
#[derive(Clone, Debug)]
pub struct Account {
    pub principal_id: String,
    pub role: Role,
    pub credential: Credential,
    pub active: bool,
}

#[async_trait]
pub trait PrincipalDirectory: Send + Sync {
    /// Look an account up by username, falling back to email.
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Account>>;

    /// Replace a stored credential, e.g. after an upgrade of hash costs.
    async fn replace_credential(&self, principal_id: &str, credential: &Credential) -> Result<()>;
}

/// Directory over the `users` table (`id`, `username`, `email`,
/// `hashed_password`, `role`, `is_active`).
#[derive(Clone, Debug)]
pub struct PgPrincipalDirectory {
    pool: PgPool,
}

impl PgPrincipalDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by(&self, column: &'static str, value: &str) -> Result<Option<Account>> {
        // `column` is one of two literals, never user input.
        let query = format!(
            "SELECT id::text AS id, role::text AS role, hashed_password, is_active \
             FROM users WHERE {column} = $1 LIMIT 1"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "users"
        );
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .with_context(|| format!("failed to look up user by {column}"))?;

        row.map(|row| -> Result<Account> {
            let role: String = row.try_get("role")?;
            Ok(Account {
                principal_id: row.try_get("id")?,
                role: Role::parse(&role),
                credential: Credential::from_phc(row.try_get::<String, _>("hashed_password")?),
                active: row.try_get("is_active")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl PrincipalDirectory for PgPrincipalDirectory {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Account>> {
        if let Some(account) = self.find_by("username", identifier).await? {
            return Ok(Some(account));
        }
        self.find_by("email", identifier).await
    }

    async fn replace_credential(&self, principal_id: &str, credential: &Credential) -> Result<()> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.sql.table = "users"
        );
        sqlx::query("UPDATE users SET hashed_password = $2 WHERE id::text = $1")
            .bind(principal_id)
            .bind(credential.as_phc())
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to replace user credential")?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct MemoryAccount {
    username: String,
    email: String,
    account: Account,
}

/// Directory held in memory, for tests and fixed service accounts.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    accounts: RwLock<HashMap<String, MemoryAccount>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, username: &str, email: &str, account: Account) {
        self.accounts.write().insert(
            account.principal_id.clone(),
            MemoryAccount {
                username: username.to_string(),
                email: email.to_string(),
                account,
            },
        );
    }
}

#[async_trait]
impl PrincipalDirectory for MemoryDirectory {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Account>> {
        let accounts = self.accounts.read();
        let by_username = accounts.values().find(|entry| entry.username == identifier);
        let found = by_username.or_else(|| accounts.values().find(|entry| entry.email == identifier));
        Ok(found.map(|entry| entry.account.clone()))
    }

    async fn replace_credential(&self, principal_id: &str, credential: &Credential) -> Result<()> {
        let mut accounts = self.accounts.write();
        let entry = accounts
            .get_mut(principal_id)
            .with_context(|| format!("unknown principal {principal_id}"))?;
        entry.account.credential = credential.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn account(id: &str) -> Account {
        Account {
            principal_id: id.to_string(),
            role: Role::User,
            credential: Credential::from_phc("$argon2id$placeholder"),
            active: true,
        }
    }

    #[tokio::test]
    async fn username_wins_over_email() -> Result<()> {
        let directory = MemoryDirectory::new();
        directory.insert("alice", "alice@example.com", account("1"));
        // A second account whose username looks like the first one's email.
        directory.insert("alice@example.com", "other@example.com", account("2"));

        let found = directory.find_by_identifier("alice@example.com").await?;
        assert_eq!(found.map(|a| a.principal_id), Some("2".to_string()));

        let found = directory.find_by_identifier("other@example.com").await?;
        assert_eq!(found.map(|a| a.principal_id), Some("2".to_string()));

        assert!(directory.find_by_identifier("bob").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn replace_credential_updates_the_account() -> Result<()> {
        let directory = MemoryDirectory::new();
        directory.insert("alice", "alice@example.com", account("1"));
        let upgraded = Credential::from_phc("$argon2id$upgraded");
        directory.replace_credential("1", &upgraded).await?;
        let found = directory.find_by_identifier("alice").await?;
        assert_eq!(found.map(|a| a.credential), Some(upgraded));
        assert!(directory.replace_credential("9", &Credential::from_phc("x")).await.is_err());
        Ok(())
    }

    #[test]
    fn role_parsing_defaults_to_user() {
        assert_eq!(Role::parse("ADMIN"), Role::Admin);
        assert_eq!(Role::parse("admin"), Role::Admin);
        assert_eq!(Role::parse("root"), Role::User);
        assert_eq!(Role::Admin.as_str(), "admin");
    }

    #[tokio::test]
    async fn extractor_requires_a_principal() -> Result<()> {
        let (mut parts, ()) = Request::builder().uri("/").body(())?.into_parts();
        let rejected = Authenticated::from_request_parts(&mut parts, &()).await;
        assert!(matches!(rejected, Err(AuthError::TokenMissing)));

        let principal = Principal {
            id: "42".to_string(),
            role: Role::Admin,
            issued_at: 10,
        };
        parts.extensions.insert(principal.clone());
        let Authenticated(found) = Authenticated::from_request_parts(&mut parts, &()).await?;
        assert_eq!(found, principal);
        Ok(())
    }
}
