//! Credential verification and password changes.
//!
//! Flow Overview:
//! 1) A custom admin credential for the username is authoritative if present.
//! 2) Otherwise a custom user credential is authoritative if present.
//! 3) Otherwise the shared initial admin password, then the shared initial user
//!    password, are tried; a match means the password must be changed.
//!
//! A custom credential fully replaces the shared passwords for that username.

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use super::{
    error::{AuthError, RejectReason},
    password::PasswordHasher,
    session::Role,
};
use crate::store::{credential_key, SessionStore};

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CredentialCheck {
    pub is_valid: bool,
    pub is_admin: bool,
    pub requires_password_change: bool,
}

impl CredentialCheck {
    fn invalid() -> Self {
        Self::default()
    }

    fn valid(role: Role, requires_password_change: bool) -> Self {
        Self {
            is_valid: true,
            is_admin: role.is_admin(),
            requires_password_change,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        if self.is_admin {
            Role::Admin
        } else {
            Role::User
        }
    }
}

fn valid_username(username: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._@-]{1,64}$").ok())
        .as_ref()
        .map_or(false, |re| re.is_match(username))
}

/// # Errors
/// Returns [`AuthError::Validation`] when the username is empty, too long or
/// contains characters outside `[A-Za-z0-9._@-]`.
pub fn validate_username(username: &str) -> Result<(), AuthError> {
    if valid_username(username) {
        Ok(())
    } else {
        Err(AuthError::Validation("Invalid username".to_string()))
    }
}

/// # Errors
/// Returns [`AuthError::Validation`] when the new password is out of bounds or
/// equal to the current one.
pub fn validate_new_password(current: &str, new: &str) -> Result<(), AuthError> {
    let length = new.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&length) {
        return Err(AuthError::Validation(format!(
            "Password must be between {MIN_PASSWORD_LEN} and {MAX_PASSWORD_LEN} characters"
        )));
    }
    if current == new {
        return Err(AuthError::Validation(
            "New password must differ from the current password".to_string(),
        ));
    }
    Ok(())
}

pub struct CredentialStore {
    store: Arc<dyn SessionStore>,
    hasher: PasswordHasher,
    initial_admin_hash: String,
    initial_user_hash: String,
}

impl CredentialStore {
    /// Hash the shared initial passwords once so every comparison takes the
    /// same derivation path.
    ///
    /// # Errors
    /// Returns an error if hashing fails.
    pub async fn new(
        store: Arc<dyn SessionStore>,
        hasher: PasswordHasher,
        initial_admin_password: &SecretString,
        initial_user_password: &SecretString,
    ) -> Result<Self, AuthError> {
        let initial_admin_hash = hasher.hash(initial_admin_password).await?;
        let initial_user_hash = hasher.hash(initial_user_password).await?;
        Ok(Self {
            store,
            hasher,
            initial_admin_hash,
            initial_user_hash,
        })
    }

    async fn custom_hash(&self, role: Role, username: &str) -> Result<Option<String>, AuthError> {
        let key = credential_key(role.as_str(), username);
        Ok(self.store.get(&key).await?)
    }

    /// # Errors
    /// Returns [`AuthError::Validation`] for a malformed username and
    /// [`AuthError::ServiceUnavailable`] when the store cannot be reached.
    pub async fn verify_credentials(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<CredentialCheck, AuthError> {
        validate_username(username)?;

        for role in [Role::Admin, Role::User] {
            if let Some(hash) = self.custom_hash(role, username).await? {
                debug!("Verifying {username} against custom {role} credential");
                let check = if self.hasher.verify(password, &hash).await? {
                    CredentialCheck::valid(role, false)
                } else {
                    CredentialCheck::invalid()
                };
                return Ok(check);
            }
        }

        if self.hasher.verify(password, &self.initial_admin_hash).await? {
            return Ok(CredentialCheck::valid(Role::Admin, true));
        }
        if self.hasher.verify(password, &self.initial_user_hash).await? {
            return Ok(CredentialCheck::valid(Role::User, true));
        }
        Ok(CredentialCheck::invalid())
    }

    /// Whether a custom password has been set in this role namespace.
    ///
    /// # Errors
    /// Returns [`AuthError::ServiceUnavailable`] when the store cannot be reached.
    pub async fn has_custom_password(&self, username: &str, role: Role) -> Result<bool, AuthError> {
        Ok(self.custom_hash(role, username).await?.is_some())
    }

    /// Re-verify the current password, then overwrite the namespace record.
    ///
    /// Nothing is written unless validation and re-verification both pass.
    ///
    /// # Errors
    /// - [`AuthError::Validation`] for a malformed username or new password.
    /// - [`AuthError::Authentication`] when `current_password` does not match.
    /// - [`AuthError::ServiceUnavailable`] when the store cannot be reached.
    pub async fn change_password(
        &self,
        username: &str,
        current_password: &SecretString,
        new_password: &SecretString,
        is_admin: bool,
    ) -> Result<(), AuthError> {
        validate_username(username)?;
        validate_new_password(current_password.expose_secret(), new_password.expose_secret())?;

        let role = if is_admin { Role::Admin } else { Role::User };
        let authoritative = match self.custom_hash(role, username).await? {
            Some(hash) => hash,
            None if is_admin => self.initial_admin_hash.clone(),
            None => self.initial_user_hash.clone(),
        };
        if !self.hasher.verify(current_password, &authoritative).await? {
            return Err(AuthError::rejected(RejectReason::InvalidCredentials));
        }

        let hash = self.hasher.hash(new_password).await?;
        self.store
            .set(&credential_key(role.as_str(), username), &hash, None)
            .await?;
        info!("Password changed for {role} {username}");
        Ok(())
    }
}
