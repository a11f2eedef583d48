//! Key-value session store used by the auth core.
//!
//! The store is the single source of truth for live sessions, user token sets
//! and custom credentials. It only needs a small surface: plain values with an
//! optional TTL, string sets, and prefix enumeration. Values are expected to be
//! encrypted at rest by the backend; the auth core never manages those keys.
//!
//! Key layout:
//! - `session:{jti}`: versioned session record, TTL = token lifetime.
//! - `user_tokens:{username}`: set of live jtis for a user.
//! - `credential:{admin|user}:{username}`: custom password hash, no TTL.

pub mod memory;
pub mod postgres;
pub mod retry;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retry::{RetryPolicy, RetryingStore};

use std::{future::Future, pin::Pin, time::Duration};

pub const SESSION_PREFIX: &str = "session:";
pub const USER_TOKENS_PREFIX: &str = "user_tokens:";
pub const CREDENTIAL_PREFIX: &str = "credential:";

/// Boxed future returned by every [`SessionStore`] operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out")]
    Timeout,
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub trait SessionStore: Send + Sync {
    /// Read a plain value. Expired keys read as `None`.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Write a plain value, replacing any previous value and TTL.
    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Option<Duration>)
    -> StoreFuture<'a, ()>;

    /// Delete a key (value or set). Returns whether something was removed.
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Overwrite an existing live value and its TTL in one step. An absent key
    /// stays absent and `false` is returned.
    fn replace<'a>(&'a self, key: &'a str, value: &'a str, ttl: Option<Duration>)
    -> StoreFuture<'a, bool>;

    /// Reset the TTL of an existing value. Returns `false` when the key is absent.
    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, bool>;

    fn set_add<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()>;

    fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()>;

    fn set_members<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>>;

    /// List every live key (values and sets) starting with `prefix`.
    fn keys<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>>;

    /// Drop expired entries. Returns how many were removed.
    fn purge_expired(&self) -> StoreFuture<'_, u64>;
}

#[must_use]
pub fn session_key(jti: &str) -> String {
    format!("{SESSION_PREFIX}{jti}")
}

#[must_use]
pub fn user_tokens_key(username: &str) -> String {
    format!("{USER_TOKENS_PREFIX}{username}")
}

#[must_use]
pub fn credential_key(namespace: &str, username: &str) -> String {
    format!("{CREDENTIAL_PREFIX}{namespace}:{username}")
}
