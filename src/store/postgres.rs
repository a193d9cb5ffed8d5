//! Postgres-backed shared store.
//!
//! Flow Overview:
//! 1) Every entry lives in the `auth_kv` table (see `sql/schema.sql`).
//! 2) Increments and conditional sets are single `INSERT … ON CONFLICT`
//!    statements, so Postgres row locking serializes concurrent callers
//!    across all service instances.
//! 3) Expired rows are ignored by every read and removed by a janitor task.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

use super::{SharedStore, StoreError, StoreResult, WindowCount};

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `auth_kv` table if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error if the DDL cannot be executed.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Delete rows whose TTL has elapsed, returning how many were removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_expired(&self) -> StoreResult<u64> {
        let span = query_span("DELETE");
        let result = sqlx::query("DELETE FROM auth_kv WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}

/// Periodically purge expired rows. Reads already skip them, so this only
/// bounds table growth.
pub fn spawn_janitor(store: PgStore, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!("purged {removed} expired auth_kv rows"),
                Err(err) => error!("Failed to purge expired auth_kv rows: {err}"),
            }
        }
    })
}

fn query_span(operation: &'static str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation
    )
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => {
            StoreError::Interrupted(err.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

fn counter_from_row(count: i64, ttl_seconds: Option<f64>, window: Duration) -> WindowCount {
    WindowCount {
        count: u64::try_from(count).unwrap_or(0),
        expires_in: ttl_seconds.map_or(window, |secs| Duration::from_secs_f64(secs.max(0.0))),
    }
}

#[async_trait]
impl SharedStore for PgStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let query = r"
            SELECT COALESCE(value, counter::text) AS value
            FROM auth_kv
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
        ";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT"))
            .await
            .map_err(map_sqlx_error)?;
        row.map(|row| row.try_get::<Option<String>, _>("value"))
            .transpose()
            .map(Option::flatten)
            .map_err(map_sqlx_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let query = r"
            INSERT INTO auth_kv (key, value, counter, expires_at)
            VALUES ($1, $2, NULL, CASE WHEN $3::float8 IS NULL THEN NULL
                                       ELSE NOW() + make_interval(secs => $3::float8) END)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, counter = NULL, expires_at = EXCLUDED.expires_at
        ";
        sqlx::query(query)
            .bind(key)
            .bind(value)
            .bind(ttl.map(|ttl| ttl.as_secs_f64()))
            .execute(&self.pool)
            .instrument(query_span("INSERT"))
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        // The conflict branch only fires for an expired row; a live row makes
        // the statement return nothing.
        let query = r"
            INSERT INTO auth_kv (key, value, counter, expires_at)
            VALUES ($1, $2, NULL, NOW() + make_interval(secs => $3::float8))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, counter = NULL, expires_at = EXCLUDED.expires_at
            WHERE auth_kv.expires_at IS NOT NULL AND auth_kv.expires_at <= NOW()
            RETURNING key
        ";
        let row = sqlx::query(query)
            .bind(key)
            .bind(value)
            .bind(ttl.as_secs_f64())
            .fetch_optional(&self.pool)
            .instrument(query_span("INSERT"))
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.is_some())
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        let query = r"
            INSERT INTO auth_kv (key, value, counter, expires_at)
            VALUES ($1, NULL, 1, NOW() + make_interval(secs => $2::float8))
            ON CONFLICT (key) DO UPDATE
            SET counter = CASE WHEN auth_kv.expires_at <= NOW() OR auth_kv.counter IS NULL
                               THEN 1 ELSE auth_kv.counter + 1 END,
                expires_at = CASE WHEN auth_kv.expires_at <= NOW() OR auth_kv.counter IS NULL
                                  THEN EXCLUDED.expires_at ELSE auth_kv.expires_at END,
                value = NULL
            RETURNING counter,
                      EXTRACT(EPOCH FROM (expires_at - NOW()))::float8 AS ttl_seconds
        ";
        let row = sqlx::query(query)
            .bind(key)
            .bind(window.as_secs_f64())
            .fetch_one(&self.pool)
            .instrument(query_span("UPSERT"))
            .await
            .map_err(map_sqlx_error)?;
        let count: i64 = row.try_get("counter").map_err(map_sqlx_error)?;
        let ttl_seconds: Option<f64> = row.try_get("ttl_seconds").map_err(map_sqlx_error)?;
        Ok(counter_from_row(count, ttl_seconds, window))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM auth_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .instrument(query_span("DELETE"))
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}
