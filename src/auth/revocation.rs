//! Single token, per user and system wide revocation.

use serde::Serialize;
use serde_json::{json, Value};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tracing::{info, warn};
use utoipa::ToSchema;

use super::{
    audit::{AuditEvent, AuditKind, AuditSink},
    error::AuthError,
    issuer::unix_now,
    session::SessionRecord,
};
use crate::store::{session_key, user_tokens_key, SessionStore, SESSION_PREFIX, USER_TOKENS_PREFIX};

/// Outcome of a bulk revocation. `attempted = revoked + stale + failed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct RevocationSummary {
    pub attempted: usize,
    pub revoked: usize,
    /// Members whose session had already expired or been revoked.
    pub stale: usize,
    pub failed: usize,
}

impl RevocationSummary {
    fn count(&mut self, outcome: &Result<bool, AuthError>) {
        self.attempted += 1;
        match outcome {
            Ok(true) => self.revoked += 1,
            Ok(false) => self.stale += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Bulk revocations re-read their targets until no new jti shows up, so a
/// token minted by a refresh racing the revocation is caught too.
const MAX_REVOCATION_PASSES: usize = 4;

pub struct RevocationManager {
    store: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditSink>,
}

impl RevocationManager {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Delete a session record and drop the jti from its owner's token set.
    ///
    /// Revoking an unknown jti succeeds. Returns whether a live record was removed.
    ///
    /// # Errors
    /// Returns [`AuthError::ServiceUnavailable`] when the store cannot be reached.
    pub async fn revoke_token(&self, jti: &str) -> Result<bool, AuthError> {
        let key = session_key(jti);
        let owner = self
            .store
            .get(&key)
            .await?
            .as_deref()
            .and_then(SessionRecord::decode)
            .map(|record| record.username);

        let removed = self.store.delete(&key).await?;
        if let Some(username) = &owner {
            self.store
                .set_remove(&user_tokens_key(username), jti)
                .await?;
        }

        if removed {
            let mut event = AuditEvent::new(AuditKind::TokenRevoked).with_details(json!({ "jti": jti }));
            if let Some(username) = owner {
                event = event.with_username(username);
            }
            self.audit.record(event.redacted());
        }
        Ok(removed)
    }

    /// Revoke every token in the user's token set.
    ///
    /// Individual failures are counted and do not stop the loop. Failed
    /// members stay in the set; every other member is removed from it.
    ///
    /// # Errors
    /// Returns [`AuthError::ServiceUnavailable`] when the set cannot be read.
    pub async fn revoke_user_tokens(&self, username: &str) -> Result<RevocationSummary, AuthError> {
        let set_key = user_tokens_key(username);
        let mut summary = RevocationSummary::default();
        let mut seen = HashSet::new();

        for _ in 0..MAX_REVOCATION_PASSES {
            let pending: Vec<String> = self
                .store
                .set_members(&set_key)
                .await?
                .into_iter()
                .filter(|jti| !seen.contains(jti))
                .collect();
            if pending.is_empty() {
                break;
            }

            for jti in pending {
                let outcome = self.revoke_token(&jti).await;
                match &outcome {
                    Ok(false) => {
                        if let Err(err) = self.store.set_remove(&set_key, &jti).await {
                            warn!("Failed to drop stale token {jti} of {username}: {err}");
                        }
                    }
                    Err(err) => warn!("Failed to revoke token {jti} for {username}: {err}"),
                    Ok(true) => {}
                }
                summary.count(&outcome);
                seen.insert(jti);
            }
        }

        info!(
            "Revoked {}/{} tokens for {username} ({} stale)",
            summary.revoked, summary.attempted, summary.stale
        );
        self.audit.record(
            AuditEvent::new(AuditKind::UserTokensRevoked)
                .with_username(username)
                .with_success(summary.failed == 0)
                .with_details(summary_details(&summary))
                .redacted(),
        );
        Ok(summary)
    }

    /// Delete every session record, then prune the user token sets.
    ///
    /// Best effort: concurrent readers may observe a partially revoked system.
    ///
    /// # Errors
    /// Returns [`AuthError::ServiceUnavailable`] when the keys cannot be listed.
    pub async fn revoke_all_tokens(&self) -> Result<RevocationSummary, AuthError> {
        let mut summary = RevocationSummary::default();
        let mut seen = HashSet::new();

        for _ in 0..MAX_REVOCATION_PASSES {
            let pending: Vec<String> = self
                .store
                .keys(SESSION_PREFIX)
                .await?
                .into_iter()
                .filter(|key| !seen.contains(key))
                .collect();
            if pending.is_empty() {
                break;
            }

            for key in pending {
                let outcome = self.store.delete(&key).await.map_err(AuthError::from);
                if let Err(err) = &outcome {
                    warn!("Failed to delete {key}: {err}");
                }
                summary.count(&outcome);
                seen.insert(key);
            }
        }

        if let Err(err) = self.prune_token_sets().await {
            warn!("Failed to prune user token sets: {err}");
        }

        warn!(
            "System wide revocation removed {}/{} sessions",
            summary.revoked, summary.attempted
        );
        self.audit.record(
            AuditEvent::new(AuditKind::AllTokensRevoked)
                .with_success(summary.failed == 0)
                .with_details(summary_details(&summary))
                .redacted(),
        );
        Ok(summary)
    }

    /// Drop token set members whose session record no longer exists.
    /// Returns how many members were removed.
    ///
    /// # Errors
    /// Returns [`AuthError::ServiceUnavailable`] when the store cannot be reached.
    pub async fn prune_token_sets(&self) -> Result<usize, AuthError> {
        let mut pruned = 0;
        for set_key in self.store.keys(USER_TOKENS_PREFIX).await? {
            for jti in self.store.set_members(&set_key).await? {
                if self.store.get(&session_key(&jti)).await?.is_none() {
                    self.store.set_remove(&set_key, &jti).await?;
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    /// Increment the recorded token version so outstanding copies of the token
    /// stop verifying. Returns the new version, or `None` when the session is gone.
    ///
    /// # Errors
    /// Returns [`AuthError::ServiceUnavailable`] when the store cannot be reached.
    pub async fn bump_token_version(&self, jti: &str) -> Result<Option<u32>, AuthError> {
        let key = session_key(jti);
        let Some(mut record) = self
            .store
            .get(&key)
            .await?
            .as_deref()
            .and_then(SessionRecord::decode)
        else {
            return Ok(None);
        };

        let remaining = record.expires_at - unix_now();
        if remaining <= 0 {
            return Ok(None);
        }

        record.token_version = record.token_version.saturating_add(1);
        let encoded = record
            .encode()
            .map_err(|err| anyhow::anyhow!("failed to encode session record: {err}"))?;
        self.store
            .set(
                &key,
                &encoded,
                Some(Duration::from_secs(remaining.unsigned_abs())),
            )
            .await?;
        Ok(Some(record.token_version))
    }
}

fn summary_details(summary: &RevocationSummary) -> Value {
    json!({
        "attempted": summary.attempted,
        "revoked": summary.revoked,
        "stale": summary.stale,
        "failed": summary.failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{
            audit::MemoryAuditSink,
            issuer::{TokenIssuer, INITIAL_TOKEN_VERSION},
            session::{Identity, Role},
        },
        store::MemoryStore,
    };
    use secrecy::SecretString;

    struct Fixture {
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditSink>,
        issuer: TokenIssuer,
        revocation: RevocationManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let issuer = TokenIssuer::new(
            store.clone(),
            Arc::new(SecretString::from(
                "0123456789abcdef0123456789abcdef".to_string(),
            )),
            "instance".to_string(),
        );
        let revocation = RevocationManager::new(store.clone(), audit.clone());
        Fixture {
            store,
            audit,
            issuer,
            revocation,
        }
    }

    async fn issue(fixture: &Fixture, username: &str, role: Role) -> Result<String, AuthError> {
        let issued = fixture
            .issuer
            .issue(
                &Identity::new(username, role),
                Duration::from_secs(3600),
                INITIAL_TOKEN_VERSION,
            )
            .await?;
        Ok(issued.jti)
    }

    #[tokio::test]
    async fn revoke_token_is_idempotent() -> Result<(), AuthError> {
        let fixture = fixture();
        let first = issue(&fixture, "alice", Role::User).await?;
        let second = issue(&fixture, "alice", Role::User).await?;

        assert!(fixture.revocation.revoke_token(&first).await?);
        assert!(!fixture.revocation.revoke_token(&first).await?);
        assert!(!fixture.revocation.revoke_token("never-issued").await?);

        assert!(fixture.store.get(&session_key(&first)).await?.is_none());
        assert!(fixture.store.get(&session_key(&second)).await?.is_some());
        assert_eq!(
            fixture.store.set_members(&user_tokens_key("alice")).await?,
            vec![second]
        );
        assert_eq!(fixture.audit.events().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn revoke_user_tokens_empties_the_set() -> Result<(), AuthError> {
        let fixture = fixture();
        for _ in 0..3 {
            issue(&fixture, "alice", Role::User).await?;
        }
        let bob = issue(&fixture, "bob", Role::User).await?;

        let summary = fixture.revocation.revoke_user_tokens("alice").await?;
        assert_eq!(
            summary,
            RevocationSummary {
                attempted: 3,
                revoked: 3,
                stale: 0,
                failed: 0
            }
        );
        assert!(fixture
            .store
            .set_members(&user_tokens_key("alice"))
            .await?
            .is_empty());
        assert!(fixture.store.get(&session_key(&bob)).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn expired_members_count_as_stale() -> Result<(), AuthError> {
        let fixture = fixture();
        let live = issue(&fixture, "alice", Role::User).await?;
        let lapsed = issue(&fixture, "alice", Role::User).await?;
        fixture
            .store
            .expire(&session_key(&lapsed), Duration::from_millis(10))
            .await?;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let summary = fixture.revocation.revoke_user_tokens("alice").await?;
        assert_eq!(
            summary,
            RevocationSummary {
                attempted: 2,
                revoked: 1,
                stale: 1,
                failed: 0
            }
        );
        assert!(fixture.store.get(&session_key(&live)).await?.is_none());
        assert!(fixture
            .store
            .set_members(&user_tokens_key("alice"))
            .await?
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn prune_drops_members_without_a_record() -> Result<(), AuthError> {
        let fixture = fixture();
        let live = issue(&fixture, "alice", Role::User).await?;
        let lapsed = issue(&fixture, "alice", Role::User).await?;
        let other = issue(&fixture, "bob", Role::User).await?;
        fixture.store.delete(&session_key(&lapsed)).await?;
        fixture.store.delete(&session_key(&other)).await?;

        assert_eq!(fixture.revocation.prune_token_sets().await?, 2);
        assert_eq!(
            fixture.store.set_members(&user_tokens_key("alice")).await?,
            vec![live]
        );
        assert!(fixture
            .store
            .set_members(&user_tokens_key("bob"))
            .await?
            .is_empty());
        assert_eq!(fixture.revocation.prune_token_sets().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn revoke_all_clears_everything() -> Result<(), AuthError> {
        let fixture = fixture();
        issue(&fixture, "alice", Role::User).await?;
        issue(&fixture, "root", Role::Admin).await?;

        let summary = fixture.revocation.revoke_all_tokens().await?;
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.revoked, 2);
        assert!(fixture.store.is_empty().await);

        let kinds: Vec<AuditKind> = fixture.audit.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::AllTokensRevoked]);
        Ok(())
    }

    #[tokio::test]
    async fn bump_increments_the_recorded_version() -> Result<(), AuthError> {
        let fixture = fixture();
        let jti = issue(&fixture, "alice", Role::User).await?;
        assert_eq!(fixture.revocation.bump_token_version(&jti).await?, Some(2));
        let record = fixture
            .store
            .get(&session_key(&jti))
            .await?
            .as_deref()
            .and_then(SessionRecord::decode);
        assert_eq!(record.map(|r| r.token_version), Some(2));
        assert_eq!(fixture.revocation.bump_token_version("gone").await?, None);
        Ok(())
    }
}
