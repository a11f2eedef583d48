//! Per-request token verification.
//!
//! Flow Overview:
//! 1) No token at all is `token_missing`.
//! 2) The token is decoded without trust; a broken structure is
//!    `token_malformed` and missing `jti`/`exp`/`iat` is `token_invalid`.
//! 3) `exp` is checked against the clock before any store round-trip.
//! 4) The session record must exist (`token_revoked` otherwise). An unreachable
//!    store is a 503, never an authentication failure.
//! 5) Signature, algorithm and issuer are checked (`token_invalid`).
//! 6) The token must come from this process (`server_mismatch`).
//! 7) The token version must match the record (`token_version_mismatch`).
//! 8) Tokens past the refresh threshold get a replacement. The old record is
//!    marked superseded and left to expire after the grace window; a
//!    superseded token is never refreshed a second time. If the old record
//!    was revoked while the replacement was being minted, the replacement is
//!    revoked as well and no token is handed out.
//! 9) The verified principal is returned, with an admin proof for admins.

use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    audit::{AuditEvent, AuditKind},
    error::{AuthError, RejectReason},
    issuer::{unix_now, IssuedToken},
    rate_limit::{RateLimitAction, RateLimitDecision},
    session::{Identity, Role, SessionRecord},
    token::{decode_unverified, verify_hs256, Claims, TokenError, ISSUER},
    AuthService,
};
use crate::store::session_key;

type HmacSha256 = Hmac<Sha256>;

/// Identity attached to a verified request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
    pub jti: String,
    pub admin_proof: Option<String>,
    /// Replacement minted by an earlier refresh while this token is in its grace window.
    pub successor: Option<String>,
}

impl Principal {
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id,
            username: self.username.clone(),
            role: self.role,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Verified {
    pub principal: Principal,
    pub refreshed: Option<IssuedToken>,
}

/// `hex(HMAC-SHA256(secret, username))`.
#[must_use]
pub fn admin_proof(username: &str, secret: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(username.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Recompute the admin proof and compare in constant time.
#[must_use]
pub fn verify_admin_proof(username: &str, proof: &str, secret: &[u8]) -> bool {
    let Ok(expected) = hex::decode(proof) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(username.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// True once less than `1 - threshold` of the lifetime remains.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn should_refresh(issued_at: i64, expires_at: i64, now: i64, threshold: f64) -> bool {
    let lifetime = expires_at - issued_at;
    if lifetime <= 0 {
        return false;
    }
    let remaining = (expires_at - now) as f64 / lifetime as f64;
    remaining < 1.0 - threshold
}

fn reject(code: RejectReason) -> AuthError {
    AuthError::rejected(code)
}

impl AuthService {
    /// # Errors
    /// See [`AuthService::verify_token_at`].
    pub async fn verify_token(&self, token: Option<&str>) -> Result<Verified, AuthError> {
        self.verify_token_at(token, unix_now()).await
    }

    /// Run the verification pipeline with `now` as the wall clock.
    ///
    /// # Errors
    /// Returns [`AuthError::Authentication`] with the rejection reason, or
    /// [`AuthError::ServiceUnavailable`] when the session store is unreachable.
    pub async fn verify_token_at(&self, token: Option<&str>, now: i64) -> Result<Verified, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| reject(RejectReason::TokenMissing))?;

        let unverified = decode_unverified(token).map_err(|_| reject(RejectReason::TokenMalformed))?;
        let (Some(jti), Some(exp), Some(_iat)) = (unverified.jti, unverified.exp, unverified.iat)
        else {
            return Err(reject(RejectReason::TokenInvalid));
        };

        if exp <= now {
            return Err(reject(RejectReason::TokenExpired));
        }

        let record = self
            .store
            .get(&session_key(&jti))
            .await?
            .as_deref()
            .and_then(SessionRecord::decode)
            .ok_or_else(|| reject(RejectReason::TokenRevoked))?;

        let claims = verify_hs256(token, self.secret.expose_secret().as_bytes(), ISSUER).map_err(
            |err: TokenError| {
                debug!("Rejecting token {jti}: {err}");
                reject(RejectReason::TokenInvalid)
            },
        )?;
        if claims.jti != record.jti || claims.username != record.username || claims.role != record.role
        {
            return Err(reject(RejectReason::TokenInvalid));
        }

        if claims.sid != self.issuer.server_instance_id() {
            return Err(reject(RejectReason::ServerMismatch));
        }

        if claims.ver != record.token_version {
            return Err(reject(RejectReason::TokenVersionMismatch));
        }

        let refreshed = if record.superseded_by.is_none()
            && should_refresh(claims.iat, claims.exp, now, self.config.refresh_threshold())
        {
            self.refresh(&claims, &record).await
        } else {
            None
        };

        let admin_proof = if record.role.is_admin() {
            admin_proof(&record.username, self.secret.expose_secret().as_bytes())
        } else {
            None
        };

        Ok(Verified {
            principal: Principal {
                id: record.user_id,
                username: record.username,
                role: record.role,
                jti: record.jti,
                admin_proof,
                successor: record.superseded_by,
            },
            refreshed,
        })
    }

    /// Mint a replacement for a token past its refresh threshold.
    ///
    /// Failures are logged and leave the current token untouched.
    async fn refresh(&self, claims: &Claims, record: &SessionRecord) -> Option<IssuedToken> {
        if self.limiter.check(RateLimitAction::Refresh, &record.username) == RateLimitDecision::Limited {
            warn!("Refresh rate limit reached for {}", record.username);
            return None;
        }

        let next_version = claims.ver.saturating_add(1);
        let issued = match self
            .issuer
            .issue(&record.identity(), self.config.token_ttl(), next_version)
            .await
        {
            Ok(issued) => issued,
            Err(err) => {
                warn!("Failed to refresh token {}: {err}", claims.jti);
                return None;
            }
        };

        if !self.retire(record, &issued.jti).await {
            if let Err(err) = self.revocation.revoke_token(&issued.jti).await {
                warn!(
                    "Failed to revoke replacement {} of revoked token {}: {err}",
                    issued.jti, claims.jti
                );
            }
            return None;
        }

        self.record_audit(
            AuditEvent::new(AuditKind::TokenRefreshed)
                .with_username(record.username.clone())
                .with_details(json!({ "previous": claims.jti, "jti": issued.jti })),
        );
        Some(issued)
    }

    /// Mark the old record superseded and let it expire after the grace window.
    ///
    /// Only a record that still exists is touched. Returns `false` when the
    /// record is gone (revoked concurrently) or the write failed. The jti
    /// stays in the user's token set until the grace window lapses so a user
    /// revocation still reaches it; maintenance prunes it afterwards.
    async fn retire(&self, record: &SessionRecord, successor: &str) -> bool {
        let key = session_key(&record.jti);
        let grace = self.config.refresh_grace();
        let retired = SessionRecord {
            superseded_by: Some(successor.to_string()),
            ..record.clone()
        };
        let result = match retired.encode() {
            Ok(encoded) => self.store.replace(&key, &encoded, Some(grace)).await,
            Err(err) => {
                warn!("Failed to encode superseded record {}: {err}", record.jti);
                self.store.expire(&key, grace).await
            }
        };
        match result {
            Ok(live) => live,
            Err(err) => {
                warn!("Failed to retire refreshed token {}: {err}", record.jti);
                false
            }
        }
    }

    /// Admin-only operations recompute the proof instead of trusting the role.
    ///
    /// # Errors
    /// Returns [`AuthError::Authorization`] when the principal is not a verified admin.
    pub fn require_admin(&self, principal: &Principal) -> Result<(), AuthError> {
        let proven = principal.role.is_admin()
            && principal.admin_proof.as_deref().is_some_and(|proof| {
                verify_admin_proof(
                    &principal.username,
                    proof,
                    self.secret.expose_secret().as_bytes(),
                )
            });
        if proven {
            Ok(())
        } else {
            Err(AuthError::forbidden())
        }
    }
}
