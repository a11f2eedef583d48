//! Token issuance.
//!
//! A token is only handed out once its session record and its entry in the
//! user token set are both stored; a token without a record could never be
//! revoked.

use anyhow::anyhow;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    error::AuthError,
    session::{Identity, SessionRecord, SESSION_RECORD_VERSION},
    token::{sign_hs256, Claims, ISSUER},
};
use crate::store::{session_key, user_tokens_key, SessionStore};

pub const INITIAL_TOKEN_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub token_version: u32,
}

impl IssuedToken {
    /// Seconds left before expiry, never negative.
    #[must_use]
    pub fn max_age_seconds(&self, now: i64) -> u64 {
        u64::try_from(self.expires_at.saturating_sub(now)).unwrap_or(0)
    }
}

pub struct TokenIssuer {
    store: Arc<dyn SessionStore>,
    secret: Arc<SecretString>,
    server_instance_id: String,
}

#[must_use]
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

impl TokenIssuer {
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        secret: Arc<SecretString>,
        server_instance_id: String,
    ) -> Self {
        Self {
            store,
            secret,
            server_instance_id,
        }
    }

    #[must_use]
    pub fn server_instance_id(&self) -> &str {
        &self.server_instance_id
    }

    /// # Errors
    /// See [`TokenIssuer::issue_at`].
    pub async fn issue(
        &self,
        identity: &Identity,
        lifetime: Duration,
        token_version: u32,
    ) -> Result<IssuedToken, AuthError> {
        self.issue_at(identity, lifetime, token_version, unix_now())
            .await
    }

    /// Mint a token as if issued at `issued_at` (unix seconds).
    ///
    /// The session record lives until the token's `exp`.
    ///
    /// # Errors
    /// - [`AuthError::ServiceUnavailable`] if either store write fails.
    /// - [`AuthError::Validation`] if the token would already be expired.
    /// - [`AuthError::Internal`] if signing fails.
    pub async fn issue_at(
        &self,
        identity: &Identity,
        lifetime: Duration,
        token_version: u32,
        issued_at: i64,
    ) -> Result<IssuedToken, AuthError> {
        let lifetime_seconds = i64::try_from(lifetime.as_secs())
            .map_err(|_| AuthError::Validation("Token lifetime is too long".to_string()))?;
        let expires_at = issued_at.saturating_add(lifetime_seconds);
        let remaining = expires_at - unix_now();
        if remaining <= 0 {
            return Err(AuthError::Validation(
                "Token lifetime has already elapsed".to_string(),
            ));
        }

        let jti = Uuid::new_v4().simple().to_string();
        let claims = Claims {
            sub: identity.id.to_string(),
            username: identity.username.clone(),
            role: identity.role,
            jti: jti.clone(),
            iat: issued_at,
            exp: expires_at,
            iss: ISSUER.to_string(),
            sid: self.server_instance_id.clone(),
            ver: token_version,
        };
        let token = sign_hs256(self.secret.expose_secret().as_bytes(), &claims)
            .map_err(|err| anyhow!("failed to sign token: {err}"))?;

        let record = SessionRecord {
            v: SESSION_RECORD_VERSION,
            jti: jti.clone(),
            user_id: identity.id,
            username: identity.username.clone(),
            role: identity.role,
            server_instance_id: self.server_instance_id.clone(),
            issued_at,
            expires_at,
            token_version,
            superseded_by: None,
        };
        let encoded = record
            .encode()
            .map_err(|err| anyhow!("failed to encode session record: {err}"))?;

        let record_key = session_key(&jti);
        let ttl = Duration::from_secs(remaining.unsigned_abs());
        self.store.set(&record_key, &encoded, Some(ttl)).await?;

        if let Err(err) = self
            .store
            .set_add(&user_tokens_key(&identity.username), &jti)
            .await
        {
            if let Err(cleanup) = self.store.delete(&record_key).await {
                warn!("Failed to remove orphaned session record {jti}: {cleanup}");
            }
            return Err(err.into());
        }

        debug!(
            "Issued token {jti} for {} {} (version {token_version})",
            identity.role, identity.username
        );

        Ok(IssuedToken {
            token,
            jti,
            issued_at,
            expires_at,
            token_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{session::Role, token::verify_hs256},
        store::{MemoryStore, StoreError, StoreFuture},
    };

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn issuer(store: Arc<dyn SessionStore>) -> TokenIssuer {
        TokenIssuer::new(
            store,
            Arc::new(SecretString::from(SECRET.to_string())),
            "instance-a".to_string(),
        )
    }

    /// Accepts plain values but refuses set writes.
    struct SetlessStore(MemoryStore);

    impl SessionStore for SetlessStore {
        fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
            self.0.get(key)
        }
        fn set<'a>(
            &'a self,
            key: &'a str,
            value: &'a str,
            ttl: Option<Duration>,
        ) -> StoreFuture<'a, ()> {
            self.0.set(key, value, ttl)
        }
        fn replace<'a>(
            &'a self,
            key: &'a str,
            value: &'a str,
            ttl: Option<Duration>,
        ) -> StoreFuture<'a, bool> {
            self.0.replace(key, value, ttl)
        }
        fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
            self.0.delete(key)
        }
        fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, bool> {
            self.0.expire(key, ttl)
        }
        fn set_add<'a>(&'a self, _key: &'a str, _member: &'a str) -> StoreFuture<'a, ()> {
            Box::pin(async { Err(StoreError::Backend("sets unavailable".to_string())) })
        }
        fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
            self.0.set_remove(key, member)
        }
        fn set_members<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
            self.0.set_members(key)
        }
        fn keys<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
            self.0.keys(prefix)
        }
        fn purge_expired(&self) -> StoreFuture<'_, u64> {
            self.0.purge_expired()
        }
    }

    #[tokio::test]
    async fn issue_writes_record_and_set() -> Result<(), AuthError> {
        let store = Arc::new(MemoryStore::new());
        let issuer = issuer(store.clone());
        let identity = Identity::new("alice", Role::User);

        let issued = issuer
            .issue(&identity, Duration::from_secs(3600), INITIAL_TOKEN_VERSION)
            .await?;
        assert_eq!(issued.jti.len(), 32);
        assert_eq!(issued.expires_at - issued.issued_at, 3600);

        let raw = store.get(&session_key(&issued.jti)).await?;
        let record = raw.as_deref().and_then(SessionRecord::decode);
        assert_eq!(record.map(|r| r.identity()), Some(identity.clone()));
        assert_eq!(
            store.set_members(&user_tokens_key("alice")).await?,
            vec![issued.jti.clone()]
        );

        let claims = verify_hs256(&issued.token, SECRET.as_bytes(), ISSUER)
            .map_err(|err| anyhow!("{err}"))?;
        assert_eq!(claims.sub, identity.id.to_string());
        assert_eq!(claims.sid, "instance-a");
        assert_eq!(claims.ver, 1);
        Ok(())
    }

    #[tokio::test]
    async fn jtis_are_unique() -> Result<(), AuthError> {
        let issuer = issuer(Arc::new(MemoryStore::new()));
        let identity = Identity::new("alice", Role::User);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let issued = issuer
                .issue(&identity, Duration::from_secs(60), INITIAL_TOKEN_VERSION)
                .await?;
            assert!(seen.insert(issued.jti));
        }
        Ok(())
    }

    #[tokio::test]
    async fn failed_set_write_leaves_no_ghost_record() -> Result<(), AuthError> {
        let inner = MemoryStore::new();
        let issuer = issuer(Arc::new(SetlessStore(inner.clone())));
        let result = issuer
            .issue(
                &Identity::new("alice", Role::User),
                Duration::from_secs(60),
                INITIAL_TOKEN_VERSION,
            )
            .await;
        assert!(matches!(result, Err(AuthError::ServiceUnavailable(_))));
        assert!(inner.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn already_elapsed_lifetimes_are_refused() {
        let issuer = issuer(Arc::new(MemoryStore::new()));
        let result = issuer
            .issue_at(
                &Identity::new("alice", Role::User),
                Duration::from_secs(60),
                INITIAL_TOKEN_VERSION,
                unix_now() - 120,
            )
            .await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
    }

    #[test]
    fn max_age_is_clamped() {
        let issued = IssuedToken {
            token: String::new(),
            jti: String::new(),
            issued_at: 0,
            expires_at: 100,
            token_version: 1,
        };
        assert_eq!(issued.max_age_seconds(40), 60);
        assert_eq!(issued.max_age_seconds(500), 0);
    }
}
