//! PBKDF2-HMAC-SHA256 password hashing.
//!
//! Encoded hashes are `base64(salt || key)` with a 16 byte salt and a 32 byte
//! key. Derivation is CPU bound, so it runs on the blocking pool and at most
//! `concurrency` derivations run at once.

use anyhow::anyhow;
use base64ct::{Base64, Encoding};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::Semaphore;

use super::error::AuthError;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const DEFAULT_ITERATIONS: u32 = 310_000;

#[must_use]
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
    key
}

/// Hash with a caller supplied salt and return the encoded form.
#[must_use]
pub fn encode_hash(password: &[u8], salt: &[u8; SALT_LEN], iterations: u32) -> String {
    let key = derive_key(password, salt, iterations);
    let mut bytes = Vec::with_capacity(SALT_LEN + KEY_LEN);
    bytes.extend_from_slice(salt);
    bytes.extend_from_slice(&key);
    Base64::encode_string(&bytes)
}

/// Check a password against an encoded hash in constant time.
///
/// A hash that cannot be decoded never matches.
#[must_use]
pub fn verify_encoded(password: &[u8], encoded: &str, iterations: u32) -> bool {
    let Ok(bytes) = Base64::decode_vec(encoded.trim()) else {
        return false;
    };
    if bytes.len() != SALT_LEN + KEY_LEN {
        return false;
    }
    let (salt, expected) = bytes.split_at(SALT_LEN);
    let key = derive_key(password, salt, iterations);
    key[..].ct_eq(expected).into()
}

#[derive(Clone, Debug)]
pub struct PasswordHasher {
    iterations: u32,
    permits: Arc<Semaphore>,
}

impl PasswordHasher {
    #[must_use]
    pub fn new(iterations: u32, concurrency: usize) -> Self {
        Self {
            iterations: iterations.max(1),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    #[must_use]
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Hash a password with a fresh random salt.
    ///
    /// # Errors
    /// Returns [`AuthError::Internal`] if the blocking task fails.
    pub async fn hash(&self, password: &SecretString) -> Result<String, AuthError> {
        let password = password.expose_secret().as_bytes().to_vec();
        let iterations = self.iterations;
        self.run(move || {
            let mut salt = [0u8; SALT_LEN];
            OsRng.fill_bytes(&mut salt);
            encode_hash(&password, &salt, iterations)
        })
        .await
    }

    /// # Errors
    /// Returns [`AuthError::Internal`] if the blocking task fails.
    pub async fn verify(&self, password: &SecretString, encoded: &str) -> Result<bool, AuthError> {
        let password = password.expose_secret().as_bytes().to_vec();
        let encoded = encoded.to_string();
        let iterations = self.iterations;
        self.run(move || verify_encoded(&password, &encoded, iterations))
            .await
    }

    async fn run<T, F>(&self, work: F) -> Result<T, AuthError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| anyhow!("key derivation pool closed: {err}"))?;
        let value = tokio::task::spawn_blocking(work)
            .await
            .map_err(|err| anyhow!("key derivation task failed: {err}"))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: u32 = 1_000;

    #[test]
    fn encoded_hash_layout() -> Result<(), base64ct::Error> {
        let encoded = encode_hash(b"hunter22", &[7u8; SALT_LEN], FAST);
        let bytes = Base64::decode_vec(&encoded)?;
        assert_eq!(bytes.len(), SALT_LEN + KEY_LEN);
        assert_eq!(&bytes[..SALT_LEN], &[7u8; SALT_LEN]);
        Ok(())
    }

    #[test]
    fn verify_matches_only_the_same_password() {
        let encoded = encode_hash(b"hunter22", &[1u8; SALT_LEN], FAST);
        assert!(verify_encoded(b"hunter22", &encoded, FAST));
        assert!(!verify_encoded(b"hunter23", &encoded, FAST));
        assert!(!verify_encoded(b"hunter22", &encoded, FAST + 1));
    }

    #[test]
    fn garbage_hashes_never_match() {
        assert!(!verify_encoded(b"x", "not base64!", FAST));
        assert!(!verify_encoded(b"x", &Base64::encode_string(&[0u8; 12]), FAST));
    }

    #[tokio::test]
    async fn hasher_salts_every_hash() -> Result<(), AuthError> {
        let hasher = PasswordHasher::new(FAST, 2);
        let password = SecretString::from("correct horse".to_string());
        let first = hasher.hash(&password).await?;
        let second = hasher.hash(&password).await?;
        assert_ne!(first, second);
        assert!(hasher.verify(&password, &first).await?);
        assert!(hasher.verify(&password, &second).await?);
        assert!(!hasher.verify(&SecretString::from("wrong".to_string()), &first).await?);
        Ok(())
    }

    #[test]
    fn default_iterations_are_strong() {
        assert!(DEFAULT_ITERATIONS >= 300_000);
        assert_eq!(PasswordHasher::new(0, 0).iterations(), 1);
    }
}
