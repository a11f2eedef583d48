//! Authentication core: credentials, tokens, sessions, revocation, CSRF and
//! rate limiting.
//!
//! [`AuthService`] owns every piece of state (session store, limiters, keys,
//! configuration) and is shared with the HTTP layer as
//! `Extension<Arc<AuthService>>`.

pub mod audit;
pub mod config;
pub mod credentials;
pub mod csrf;
pub mod error;
pub mod headers;
pub mod issuer;
pub mod password;
pub mod rate_limit;
pub mod revocation;
pub mod session;
pub mod token;
pub mod verify;

pub use audit::{AuditEvent, AuditKind, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::{AuthConfig, AuthSecrets};
pub use credentials::{CredentialCheck, CredentialStore};
pub use error::{AuthError, RejectReason};
pub use issuer::{IssuedToken, TokenIssuer};
pub use rate_limit::{
    FixedWindowRateLimiter, NoopRateLimiter, RateLimitAction, RateLimitDecision, RateLimiter,
    RateLimitWindow,
};
pub use revocation::{RevocationManager, RevocationSummary};
pub use session::{Identity, Role};
pub use verify::{admin_proof, verify_admin_proof, Principal, Verified};

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{RetryingStore, SessionStore};
use config::MIN_JWT_SECRET_BYTES;
use issuer::INITIAL_TOKEN_VERSION;
use password::PasswordHasher;

pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Clone, Debug)]
pub struct LoginOutcome {
    pub identity: Identity,
    pub token: IssuedToken,
    pub requires_password_change: bool,
}

pub struct AuthService {
    config: AuthConfig,
    store: Arc<dyn SessionStore>,
    credentials: CredentialStore,
    issuer: TokenIssuer,
    revocation: RevocationManager,
    limiter: Arc<dyn RateLimiter>,
    audit: Arc<dyn AuditSink>,
    secret: Arc<SecretString>,
}

pub struct AuthServiceBuilder {
    config: AuthConfig,
    secrets: AuthSecrets,
    backend: Arc<dyn SessionStore>,
    limiter: Option<Arc<dyn RateLimiter>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl AuthServiceBuilder {
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Wrap the backend in the retry policy, hash the shared initial passwords
    /// and pick a fresh server instance id.
    ///
    /// # Errors
    /// Returns [`AuthError::Validation`] for a short signing secret, or an
    /// internal error if hashing fails.
    pub async fn build(self) -> Result<AuthService, AuthError> {
        if self.secrets.jwt_secret.expose_secret().len() < MIN_JWT_SECRET_BYTES {
            return Err(AuthError::Validation(format!(
                "JWT secret must be at least {MIN_JWT_SECRET_BYTES} bytes"
            )));
        }

        let config = self.config;
        let store: Arc<dyn SessionStore> =
            Arc::new(RetryingStore::new(self.backend, config.store_retry()));
        let limiter: Arc<dyn RateLimiter> = match self.limiter {
            Some(limiter) => limiter,
            None => Arc::new(FixedWindowRateLimiter::new(
                config.login_limit(),
                config.refresh_limit(),
            )),
        };
        let audit: Arc<dyn AuditSink> = match self.audit {
            Some(audit) => audit,
            None => Arc::new(TracingAuditSink),
        };
        let secret = Arc::new(self.secrets.jwt_secret);

        let hasher = PasswordHasher::new(config.pbkdf2_iterations(), config.kdf_concurrency());
        let credentials = CredentialStore::new(
            store.clone(),
            hasher,
            &self.secrets.admin_password,
            &self.secrets.user_password,
        )
        .await?;

        let server_instance_id = Uuid::new_v4().to_string();
        info!("Auth service instance {server_instance_id}");
        let issuer = TokenIssuer::new(store.clone(), secret.clone(), server_instance_id);
        let revocation = RevocationManager::new(store.clone(), audit.clone());

        Ok(AuthService {
            config,
            store,
            credentials,
            issuer,
            revocation,
            limiter,
            audit,
            secret,
        })
    }
}

impl AuthService {
    #[must_use]
    pub fn builder(
        config: AuthConfig,
        secrets: AuthSecrets,
        backend: Arc<dyn SessionStore>,
    ) -> AuthServiceBuilder {
        AuthServiceBuilder {
            config,
            secrets,
            backend,
            limiter: None,
            audit: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    #[must_use]
    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    #[must_use]
    pub fn revocation(&self) -> &RevocationManager {
        &self.revocation
    }

    #[must_use]
    pub fn server_instance_id(&self) -> &str {
        self.issuer.server_instance_id()
    }

    /// Check credentials and issue a session token.
    ///
    /// Attempts are rate limited per client IP before any key derivation runs,
    /// and failures wait a fixed delay before returning.
    ///
    /// # Errors
    /// - [`AuthError::Validation`] for missing or malformed input.
    /// - [`AuthError::RateLimited`] once the IP exceeded its window.
    /// - [`AuthError::Authentication`] for wrong credentials.
    /// - [`AuthError::ServiceUnavailable`] when the store cannot be reached.
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
        client_ip: Option<&str>,
    ) -> Result<LoginOutcome, AuthError> {
        let username = username.trim();
        if username.is_empty() || password.expose_secret().is_empty() {
            return Err(AuthError::Validation(
                "Username and password are required".to_string(),
            ));
        }

        let ip_key = client_ip.unwrap_or(UNKNOWN_CLIENT);
        if self.limiter.check(RateLimitAction::Login, ip_key) == RateLimitDecision::Limited {
            warn!("Login rate limit reached for {ip_key}");
            self.record_audit(
                AuditEvent::new(AuditKind::LoginFailed)
                    .with_username(username)
                    .with_ip(client_ip)
                    .with_success(false)
                    .with_details(json!({ "reason": "rate_limited" })),
            );
            return Err(AuthError::RateLimited);
        }

        let check = self.credentials.verify_credentials(username, password).await?;
        if !check.is_valid {
            self.record_audit(
                AuditEvent::new(AuditKind::LoginFailed)
                    .with_username(username)
                    .with_ip(client_ip)
                    .with_success(false)
                    .with_details(json!({ "reason": "invalid_credentials" })),
            );
            tokio::time::sleep(self.config.failed_login_delay()).await;
            return Err(AuthError::rejected(RejectReason::InvalidCredentials));
        }

        let identity = Identity::new(username, check.role());
        let token = self
            .issuer
            .issue(&identity, self.config.token_ttl(), INITIAL_TOKEN_VERSION)
            .await?;

        self.record_audit(
            AuditEvent::new(AuditKind::LoginSucceeded)
                .with_username(username)
                .with_ip(client_ip)
                .with_details(json!({
                    "role": identity.role.as_str(),
                    "firstLogin": check.requires_password_change,
                })),
        );

        Ok(LoginOutcome {
            identity,
            token,
            requires_password_change: check.requires_password_change,
        })
    }

    /// Revoke the presented token together with every replacement known for it:
    /// one minted on this request, or one minted earlier while the presented
    /// token is still in its grace window.
    async fn revoke_lineage(
        &self,
        principal: &Principal,
        refreshed: Option<&IssuedToken>,
    ) -> Result<(), AuthError> {
        self.revocation.revoke_token(&principal.jti).await?;
        if let Some(refreshed) = refreshed {
            self.revocation.revoke_token(&refreshed.jti).await?;
        }
        if let Some(successor) = &principal.successor {
            self.revocation.revoke_token(successor).await?;
        }
        Ok(())
    }

    /// Revoke the presented token and any replacement of it.
    ///
    /// # Errors
    /// Returns [`AuthError::ServiceUnavailable`] when the store cannot be reached.
    pub async fn logout(
        &self,
        principal: &Principal,
        refreshed: Option<&IssuedToken>,
    ) -> Result<(), AuthError> {
        self.revoke_lineage(principal, refreshed).await?;
        self.record_audit(
            AuditEvent::new(AuditKind::Logout).with_username(principal.username.clone()),
        );
        Ok(())
    }

    /// Change the caller's password, then swap the current token for a fresh one.
    ///
    /// # Errors
    /// See [`CredentialStore::change_password`]; issuing the new token may
    /// also fail with [`AuthError::ServiceUnavailable`].
    pub async fn change_password(
        &self,
        principal: &Principal,
        refreshed: Option<&IssuedToken>,
        current_password: &SecretString,
        new_password: &SecretString,
    ) -> Result<IssuedToken, AuthError> {
        self.credentials
            .change_password(
                &principal.username,
                current_password,
                new_password,
                principal.role.is_admin(),
            )
            .await?;

        self.revoke_lineage(principal, refreshed).await?;
        let token = self
            .issuer
            .issue(
                &principal.identity(),
                self.config.token_ttl(),
                INITIAL_TOKEN_VERSION,
            )
            .await?;

        self.record_audit(
            AuditEvent::new(AuditKind::PasswordChanged).with_username(principal.username.clone()),
        );
        Ok(token)
    }

    /// # Errors
    /// Returns [`AuthError::Authorization`] unless the caller is a verified admin.
    pub async fn revoke_user(
        &self,
        principal: &Principal,
        username: &str,
    ) -> Result<RevocationSummary, AuthError> {
        self.require_admin(principal)?;
        credentials::validate_username(username)?;
        info!("{} revoking every token of {username}", principal.username);
        self.revocation.revoke_user_tokens(username).await
    }

    /// Revoke every session in the system and hand the caller a fresh token.
    ///
    /// # Errors
    /// Returns [`AuthError::Authorization`] unless the caller is a verified
    /// admin, or [`AuthError::ServiceUnavailable`] when the store cannot be reached.
    pub async fn revoke_all(
        &self,
        principal: &Principal,
    ) -> Result<(RevocationSummary, IssuedToken), AuthError> {
        self.require_admin(principal)?;
        warn!("{} revoking every session", principal.username);
        let summary = self.revocation.revoke_all_tokens().await?;
        let token = self
            .issuer
            .issue(
                &principal.identity(),
                self.config.token_ttl(),
                INITIAL_TOKEN_VERSION,
            )
            .await?;
        Ok((summary, token))
    }

    fn record_audit(&self, event: AuditEvent) {
        self.audit.record(event.redacted());
    }

    /// Drop expired store entries, token set members without a session, and
    /// stale rate-limit windows.
    pub async fn run_maintenance(&self) {
        match self.store.purge_expired().await {
            Ok(0) => {}
            Ok(removed) => debug!("Purged {removed} expired store entries"),
            Err(err) => warn!("Failed to purge expired store entries: {err}"),
        }
        match self.revocation.prune_token_sets().await {
            Ok(0) => {}
            Ok(pruned) => debug!("Pruned {pruned} stale user token set members"),
            Err(err) => warn!("Failed to prune user token sets: {err}"),
        }
        let swept = self.limiter.sweep();
        if swept > 0 {
            debug!("Evicted {swept} stale rate limit windows");
        }
    }

    pub fn spawn_maintenance(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                service.run_maintenance().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{session_key, user_tokens_key, MemoryStore, StoreFuture, SESSION_PREFIX};
    use base64ct::{Base64UrlUnpadded, Encoding};
    use std::sync::atomic::{AtomicBool, Ordering};
    use token::{sign_hs256, verify_hs256, ISSUER};

    type TestResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

    const SIGNING_SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    fn secrets() -> AuthSecrets {
        AuthSecrets::new(
            secret(SIGNING_SECRET),
            secret("initial-admin"),
            secret("initial-user"),
        )
    }

    fn config() -> AuthConfig {
        AuthConfig::default()
            .with_pbkdf2_iterations(1_000)
            .with_failed_login_delay(Duration::ZERO)
    }

    async fn service() -> Result<(AuthService, Arc<MemoryAuditSink>), AuthError> {
        let audit = Arc::new(MemoryAuditSink::new());
        let service = AuthService::builder(config(), secrets(), Arc::new(MemoryStore::new()))
            .with_audit_sink(audit.clone())
            .build()
            .await?;
        Ok((service, audit))
    }

    #[tokio::test]
    async fn short_secrets_are_refused() {
        let secrets = AuthSecrets::new(secret("short"), secret("a"), secret("b"));
        let result = AuthService::builder(config(), secrets, Arc::new(MemoryStore::new()))
            .build()
            .await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
    }

    #[tokio::test]
    async fn login_then_verify_yields_the_same_identity() -> Result<(), AuthError> {
        let (service, audit) = service().await?;
        let outcome = service
            .login("alice", &secret("initial-user"), Some("203.0.113.7"))
            .await?;
        assert!(outcome.requires_password_change);

        let verified = service.verify_token(Some(&outcome.token.token)).await?;
        assert_eq!(verified.principal.identity(), outcome.identity);
        assert_eq!(verified.principal.jti, outcome.token.jti);
        assert!(verified.principal.admin_proof.is_none());
        assert!(verified.refreshed.is_none());

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::LoginSucceeded);
        assert_eq!(events[0].ip.as_deref(), Some("203.0.113.7"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_login_is_generic() -> Result<(), AuthError> {
        let (service, audit) = service().await?;
        let result = service.login("alice", &secret("wrong"), None).await;
        assert!(matches!(
            result,
            Err(AuthError::Authentication {
                code: RejectReason::InvalidCredentials
            })
        ));
        assert_eq!(audit.events()[0].kind, AuditKind::LoginFailed);

        let empty = service.login("", &secret("x"), None).await;
        assert!(matches!(empty, Err(AuthError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn admins_carry_a_verifiable_proof() -> Result<(), AuthError> {
        let (service, _) = service().await?;
        let outcome = service
            .login("root", &secret("initial-admin"), None)
            .await?;
        let principal = service
            .verify_token(Some(&outcome.token.token))
            .await?
            .principal;
        assert_eq!(principal.role, Role::Admin);
        assert!(service.require_admin(&principal).is_ok());

        let forged = Principal {
            admin_proof: Some("00".repeat(32)),
            ..principal.clone()
        };
        assert!(service.require_admin(&forged).is_err());

        let promoted = Principal {
            role: Role::Admin,
            admin_proof: None,
            ..principal
        };
        assert!(service.require_admin(&promoted).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn other_instances_reject_the_token() -> Result<(), AuthError> {
        let backend = Arc::new(MemoryStore::new());
        let first = AuthService::builder(config(), secrets(), backend.clone())
            .build()
            .await?;
        let restarted = AuthService::builder(config(), secrets(), backend)
            .build()
            .await?;
        assert_ne!(first.server_instance_id(), restarted.server_instance_id());

        let outcome = first.login("alice", &secret("initial-user"), None).await?;
        let result = restarted.verify_token(Some(&outcome.token.token)).await;
        assert!(matches!(
            result,
            Err(AuthError::Authentication {
                code: RejectReason::ServerMismatch
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_rotates_and_keeps_a_grace_window() -> Result<(), AuthError> {
        let service = AuthService::builder(
            config().with_refresh_grace(Duration::from_millis(300)),
            secrets(),
            Arc::new(MemoryStore::new()),
        )
        .build()
        .await?;
        let outcome = service.login("alice", &secret("initial-user"), None).await?;
        let old = outcome.token;

        // Seven hours into an eight hour token.
        let late = old.issued_at + 7 * 3600;
        let verified = service.verify_token_at(Some(&old.token), late).await?;
        let refreshed = verified.refreshed.ok_or_else(|| {
            AuthError::Validation("expected a refreshed token".to_string())
        })?;
        assert_ne!(refreshed.jti, old.jti);
        assert_eq!(refreshed.token_version, old.token_version + 1);

        // Within the grace window the old token still verifies, without a second refresh.
        let again = service.verify_token_at(Some(&old.token), late).await?;
        assert!(again.refreshed.is_none());
        assert_eq!(again.principal.jti, old.jti);

        let current = service.verify_token(Some(&refreshed.token)).await?;
        assert_eq!(current.principal.jti, refreshed.jti);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let expired = service.verify_token(Some(&old.token)).await;
        assert!(matches!(
            expired,
            Err(AuthError::Authentication {
                code: RejectReason::TokenRevoked
            })
        ));
        assert!(service.verify_token(Some(&refreshed.token)).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn maintenance_purges_expired_records() -> Result<(), AuthError> {
        let backend = Arc::new(MemoryStore::new());
        let service = AuthService::builder(config(), secrets(), backend.clone())
            .build()
            .await?;
        backend
            .set("session:stale", "{}", Some(Duration::from_millis(10)))
            .await?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        service.run_maintenance().await;
        assert!(backend.keys("session:").await?.is_empty());
        assert!(backend.is_empty().await);
        Ok(())
    }

    fn expect_rejection(result: Result<Verified, AuthError>, expected: RejectReason) {
        match result {
            Err(AuthError::Authentication { code }) => assert_eq!(code, expected),
            Err(other) => panic!("expected {expected}, got {other}"),
            Ok(verified) => panic!("expected {expected}, token {} verified", verified.principal.jti),
        }
    }

    fn refreshed(verified: Verified) -> Result<IssuedToken, AuthError> {
        verified
            .refreshed
            .ok_or_else(|| AuthError::Validation("expected a refreshed token".to_string()))
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected_before_the_store() -> Result<(), AuthError> {
        let (service, _) = service().await?;
        let token = service
            .login("alice", &secret("initial-user"), None)
            .await?
            .token;
        expect_rejection(
            service.verify_token_at(Some(&token.token), token.expires_at).await,
            RejectReason::TokenExpired,
        );
        expect_rejection(
            service
                .verify_token_at(Some(&token.token), token.expires_at + 60)
                .await,
            RejectReason::TokenExpired,
        );
        assert!(service
            .verify_token_at(Some(&token.token), token.expires_at - 1)
            .await
            .is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn bumped_version_rejects_the_outstanding_token() -> Result<(), AuthError> {
        let (service, _) = service().await?;
        let token = service
            .login("alice", &secret("initial-user"), None)
            .await?
            .token;
        assert!(service.verify_token(Some(&token.token)).await.is_ok());

        assert_eq!(service.revocation().bump_token_version(&token.jti).await?, Some(2));
        expect_rejection(
            service.verify_token(Some(&token.token)).await,
            RejectReason::TokenVersionMismatch,
        );
        Ok(())
    }

    #[tokio::test]
    async fn forged_tokens_with_a_live_record_are_invalid() -> TestResult {
        let (service, _) = service().await?;
        let token = service
            .login("alice", &secret("initial-user"), None)
            .await?
            .token;
        let claims = verify_hs256(&token.token, SIGNING_SECRET.as_bytes(), ISSUER)?;

        let wrong_key = sign_hs256(b"fedcba9876543210fedcba9876543210", &claims)?;
        expect_rejection(
            service.verify_token(Some(&wrong_key)).await,
            RejectReason::TokenInvalid,
        );

        let foreign_issuer = sign_hs256(
            SIGNING_SECRET.as_bytes(),
            &token::Claims {
                iss: "someone-else".to_string(),
                ..claims.clone()
            },
        )?;
        expect_rejection(
            service.verify_token(Some(&foreign_issuer)).await,
            RejectReason::TokenInvalid,
        );

        let promoted = sign_hs256(
            b"fedcba9876543210fedcba9876543210",
            &token::Claims {
                role: Role::Admin,
                ..claims
            },
        )?;
        expect_rejection(
            service.verify_token(Some(&promoted)).await,
            RejectReason::TokenInvalid,
        );

        // The genuine token is untouched by the attempts.
        assert!(service.verify_token(Some(&token.token)).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn structural_problems_map_to_their_reasons() -> Result<(), AuthError> {
        let (service, _) = service().await?;
        let segment =
            |value: serde_json::Value| Base64UrlUnpadded::encode_string(value.to_string().as_bytes());
        let header = segment(json!({ "alg": "HS256", "typ": "JWT" }));
        let now = issuer::unix_now();

        expect_rejection(service.verify_token(None).await, RejectReason::TokenMissing);
        expect_rejection(service.verify_token(Some("  ")).await, RejectReason::TokenMissing);
        expect_rejection(
            service.verify_token(Some("not-a-token")).await,
            RejectReason::TokenMalformed,
        );
        expect_rejection(
            service.verify_token(Some("a.b.c.d")).await,
            RejectReason::TokenMalformed,
        );

        for claims in [
            json!({ "iat": now, "exp": now + 3600 }),
            json!({ "jti": "abc", "iat": now }),
            json!({ "jti": "abc", "exp": now + 3600 }),
            json!({ "jti": "", "iat": now, "exp": now + 3600 }),
        ] {
            let token = format!("{header}.{}.c2ln", segment(claims));
            expect_rejection(
                service.verify_token(Some(&token)).await,
                RejectReason::TokenInvalid,
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn logout_during_grace_revokes_the_replacement() -> Result<(), AuthError> {
        let (service, _) = service().await?;
        let old = service
            .login("alice", &secret("initial-user"), None)
            .await?
            .token;
        let late = old.issued_at + 7 * 3600;
        let replacement = refreshed(service.verify_token_at(Some(&old.token), late).await?)?;

        let stale = service.verify_token_at(Some(&old.token), late).await?;
        assert_eq!(stale.principal.successor.as_deref(), Some(replacement.jti.as_str()));
        service.logout(&stale.principal, None).await?;

        expect_rejection(
            service.verify_token(Some(&old.token)).await,
            RejectReason::TokenRevoked,
        );
        expect_rejection(
            service.verify_token(Some(&replacement.token)).await,
            RejectReason::TokenRevoked,
        );
        Ok(())
    }

    #[tokio::test]
    async fn maintenance_prunes_superseded_members() -> Result<(), AuthError> {
        let backend = Arc::new(MemoryStore::new());
        let service = AuthService::builder(
            config().with_refresh_grace(Duration::from_millis(50)),
            secrets(),
            backend.clone(),
        )
        .build()
        .await?;
        let mut current = service
            .login("alice", &secret("initial-user"), None)
            .await?
            .token;
        for _ in 0..5 {
            let late = current.issued_at + 7 * 3600;
            current = refreshed(service.verify_token_at(Some(&current.token), late).await?)?;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        service.run_maintenance().await;

        assert_eq!(
            backend.set_members(&user_tokens_key("alice")).await?,
            vec![current.jti.clone()]
        );
        assert_eq!(
            backend.keys(SESSION_PREFIX).await?,
            vec![session_key(&current.jti)]
        );

        let summary = service.revocation().revoke_user_tokens("alice").await?;
        assert_eq!((summary.attempted, summary.revoked, summary.stale), (1, 1, 0));
        Ok(())
    }

    /// Memory store whose `set_add` can be slowed down, to hold a refresh
    /// between writing the new record and registering it with the user.
    #[derive(Default)]
    struct SlowSets {
        inner: MemoryStore,
        slow: AtomicBool,
    }

    impl SessionStore for SlowSets {
        fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
            self.inner.get(key)
        }
        fn set<'a>(
            &'a self,
            key: &'a str,
            value: &'a str,
            ttl: Option<Duration>,
        ) -> StoreFuture<'a, ()> {
            self.inner.set(key, value, ttl)
        }
        fn replace<'a>(
            &'a self,
            key: &'a str,
            value: &'a str,
            ttl: Option<Duration>,
        ) -> StoreFuture<'a, bool> {
            self.inner.replace(key, value, ttl)
        }
        fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
            self.inner.delete(key)
        }
        fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, bool> {
            self.inner.expire(key, ttl)
        }
        fn set_add<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
            Box::pin(async move {
                if self.slow.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                self.inner.set_add(key, member).await
            })
        }
        fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
            self.inner.set_remove(key, member)
        }
        fn set_members<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
            self.inner.set_members(key)
        }
        fn keys<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
            self.inner.keys(prefix)
        }
        fn purge_expired(&self) -> StoreFuture<'_, u64> {
            self.inner.purge_expired()
        }
    }

    async fn refresh_racing<F, Fut>(revoke: F) -> TestResult
    where
        F: FnOnce(Arc<AuthService>) -> Fut,
        Fut: std::future::Future<Output = Result<RevocationSummary, AuthError>>,
    {
        let backend = Arc::new(SlowSets::default());
        let service = Arc::new(
            AuthService::builder(config(), secrets(), backend.clone())
                .build()
                .await?,
        );
        let old = service
            .login("alice", &secret("initial-user"), None)
            .await?
            .token;
        backend.slow.store(true, Ordering::SeqCst);

        let late = old.issued_at + 7 * 3600;
        let refreshing = {
            let service = Arc::clone(&service);
            let token = old.token.clone();
            tokio::spawn(async move { service.verify_token_at(Some(&token), late).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = revoke(Arc::clone(&service)).await?;
        assert_eq!(summary.failed, 0);

        let verified = refreshing.await??;
        assert!(verified.refreshed.is_none());
        backend.slow.store(false, Ordering::SeqCst);

        expect_rejection(
            service.verify_token(Some(&old.token)).await,
            RejectReason::TokenRevoked,
        );
        assert!(backend.keys(SESSION_PREFIX).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn refresh_racing_a_user_revocation_stays_revoked() -> TestResult {
        refresh_racing(|service| async move {
            service.revocation().revoke_user_tokens("alice").await
        })
        .await
    }

    #[tokio::test]
    async fn refresh_racing_a_global_revocation_stays_revoked() -> TestResult {
        refresh_racing(|service| async move { service.revocation().revoke_all_tokens().await })
            .await
    }
}
