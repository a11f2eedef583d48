//! Bounded retry with per-attempt timeouts around any [`SessionStore`].
//!
//! Every store call made by the auth core goes through [`RetryingStore`]. A call
//! either succeeds within the policy or resolves to [`StoreError::Unavailable`];
//! it never hangs and never silently succeeds.

use std::{sync::Arc, time::Duration};
use tokio::time::{sleep, timeout};
use tracing::{error, warn};

use super::{SessionStore, StoreError, StoreFuture};

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    attempt_timeout: Duration,
    backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(attempts: u32, attempt_timeout: Duration, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            attempt_timeout,
            backoff,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Run `call` until it succeeds or the attempts are exhausted.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] once every attempt failed or timed out.
    pub async fn run<'a, T, F>(self, operation: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> StoreFuture<'a, T>,
    {
        let mut last_error = StoreError::Timeout;
        for attempt in 1..=self.attempts {
            if attempt > 1 {
                sleep(self.backoff * (attempt - 1)).await;
            }

            match timeout(self.attempt_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    warn!("Store {operation} failed (attempt {attempt}/{}): {err}", self.attempts);
                    last_error = err;
                }
                Err(_) => {
                    warn!(
                        "Store {operation} timed out after {:?} (attempt {attempt}/{})",
                        self.attempt_timeout, self.attempts
                    );
                    last_error = StoreError::Timeout;
                }
            }
        }

        error!("Store {operation} unavailable after {} attempts", self.attempts);
        Err(StoreError::Unavailable(format!("{operation}: {last_error}")))
    }
}

/// Decorates a store so that every operation is retried under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryingStore {
    inner: Arc<dyn SessionStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    #[must_use]
    pub fn new(inner: Arc<dyn SessionStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

impl SessionStore for RetryingStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(self.policy.run("get", move || self.inner.get(key)))
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.policy.run("set", move || self.inner.set(key, value, ttl)))
    }

    fn replace<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<Duration>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(
            self.policy
                .run("replace", move || self.inner.replace(key, value, ttl)),
        )
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.policy.run("delete", move || self.inner.delete(key)))
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, bool> {
        Box::pin(self.policy.run("expire", move || self.inner.expire(key, ttl)))
    }

    fn set_add<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.policy.run("set_add", move || self.inner.set_add(key, member)))
    }

    fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(
            self.policy
                .run("set_remove", move || self.inner.set_remove(key, member)),
        )
    }

    fn set_members<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(self.policy.run("set_members", move || self.inner.set_members(key)))
    }

    fn keys<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(self.policy.run("keys", move || self.inner.keys(prefix)))
    }

    fn purge_expired(&self) -> StoreFuture<'_, u64> {
        Box::pin(self.policy.run("purge_expired", move || self.inner.purge_expired()))
    }
}
