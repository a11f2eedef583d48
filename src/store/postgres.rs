//! `PostgreSQL` backed session store.
//!
//! Flow Overview:
//! 1) Plain values live in `auth_kv` with an optional `expires_at`.
//! 2) Sets live in `auth_set_members`, one row per member.
//! 3) Reads ignore expired rows; [`SessionStore::purge_expired`] deletes them.
//!
//! Because expiry is a column rather than an in-memory timer, deferred deletes
//! (the refresh grace window) survive process restarts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::{info_span, Instrument};

use super::{SessionStore, StoreError, StoreFuture};

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

    /// Connect to the database and make sure the schema exists.
    ///
    /// # Errors
    /// Returns an error if the connection or the schema statements fail.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .acquire_timeout(Duration::from_secs(3))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Apply `sql/schema.sql`. Every statement is idempotent.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for (index, statement) in split_sql_statements(SCHEMA_SQL).iter().enumerate() {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to execute schema statement {}", index + 1))?;
        }
        Ok(())
    }
}

fn expiry_from_ttl(ttl: Duration) -> Result<DateTime<Utc>, StoreError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|err| StoreError::Backend(format!("invalid ttl: {err}")))?;
    Ok(Utc::now() + ttl)
}

fn db_span(operation: &'static str) -> tracing::Span {
    info_span!("db.query", db.system = "postgresql", db.operation = operation)
}

fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }

    statements
}

impl SessionStore for PgStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let query = "SELECT value FROM auth_kv WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())";
            let value = sqlx::query_scalar::<_, String>(query)
                .bind(key)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT"))
                .await?;
            Ok(value)
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = ttl.map(expiry_from_ttl).transpose()?;
            let query = r"
                INSERT INTO auth_kv (key, value, expires_at) VALUES ($1, $2, $3)
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            ";
            sqlx::query(query)
                .bind(key)
                .bind(value)
                .bind(expires_at)
                .execute(&self.pool)
                .instrument(db_span("INSERT"))
                .await?;
            Ok(())
        })
    }

    fn replace<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let expires_at = ttl.map(expiry_from_ttl).transpose()?;
            let query = r"
                UPDATE auth_kv SET value = $2, expires_at = $3
                WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())
            ";
            let updated = sqlx::query(query)
                .bind(key)
                .bind(value)
                .bind(expires_at)
                .execute(&self.pool)
                .instrument(db_span("UPDATE"))
                .await?
                .rows_affected();
            Ok(updated > 0)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let values = sqlx::query(
                "DELETE FROM auth_kv WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
            )
            .bind(key)
            .execute(&mut *tx)
            .instrument(db_span("DELETE"))
            .await?
            .rows_affected();
            let members = sqlx::query("DELETE FROM auth_set_members WHERE key = $1")
                .bind(key)
                .execute(&mut *tx)
                .instrument(db_span("DELETE"))
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok(values + members > 0)
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let expires_at = expiry_from_ttl(ttl)?;
            let query = "UPDATE auth_kv SET expires_at = $2 WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())";
            let updated = sqlx::query(query)
                .bind(key)
                .bind(expires_at)
                .execute(&self.pool)
                .instrument(db_span("UPDATE"))
                .await?
                .rows_affected();
            Ok(updated > 0)
        })
    }

    fn set_add<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let query = "INSERT INTO auth_set_members (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING";
            sqlx::query(query)
                .bind(key)
                .bind(member)
                .execute(&self.pool)
                .instrument(db_span("INSERT"))
                .await?;
            Ok(())
        })
    }

    fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query("DELETE FROM auth_set_members WHERE key = $1 AND member = $2")
                .bind(key)
                .bind(member)
                .execute(&self.pool)
                .instrument(db_span("DELETE"))
                .await?;
            Ok(())
        })
    }

    fn set_members<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let query = "SELECT member FROM auth_set_members WHERE key = $1 ORDER BY member";
            let members = sqlx::query_scalar::<_, String>(query)
                .bind(key)
                .fetch_all(&self.pool)
                .instrument(db_span("SELECT"))
                .await?;
            Ok(members)
        })
    }

    fn keys<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let query = r"
                SELECT key FROM auth_kv
                WHERE left(key, length($1)) = $1 AND (expires_at IS NULL OR expires_at > now())
                UNION
                SELECT DISTINCT key FROM auth_set_members WHERE left(key, length($1)) = $1
                ORDER BY key
            ";
            let keys = sqlx::query_scalar::<_, String>(query)
                .bind(prefix)
                .fetch_all(&self.pool)
                .instrument(db_span("SELECT"))
                .await?;
            Ok(keys)
        })
    }

    fn purge_expired(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let query = "DELETE FROM auth_kv WHERE expires_at IS NOT NULL AND expires_at <= now()";
            let removed = sqlx::query(query)
                .execute(&self.pool)
                .instrument(db_span("DELETE"))
                .await?
                .rows_affected();
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_statements() {
        let statements = split_sql_statements(SCHEMA_SQL);
        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS auth_kv"));
        assert!(statements
            .iter()
            .all(|statement| statement.trim_end().ends_with(';')));
    }

    #[test]
    fn expiry_is_in_the_future() -> Result<(), StoreError> {
        let before = Utc::now();
        let expires_at = expiry_from_ttl(Duration::from_secs(30))?;
        assert!(expires_at > before);
        Ok(())
    }
}
