//! HS256 JSON Web Tokens.
//!
//! Only `HS256` is accepted; the header is checked against the allow-list
//! before any signature work, so `none` and algorithm confusion are rejected by
//! construction.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use super::session::Role;

pub const ISSUER: &str = "oplog";
pub const ALLOWED_ALGORITHMS: &[&str] = &["HS256"];

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
}

impl TokenHeader {
    fn hs256() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: Role,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub sid: String,
    #[serde(default = "default_version")]
    pub ver: u32,
}

fn default_version() -> u32 {
    1
}

/// Timing claims read before the signature is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnverifiedClaims {
    pub jti: Option<String>,
    pub iat: Option<i64>,
    pub exp: Option<i64>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signing key")]
    Key,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid issuer")]
    InvalidIssuer,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn split(token: &str) -> Result<(&str, &str, &str), TokenError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    if parts.next().is_some() || header_b64.is_empty() || claims_b64.is_empty() {
        return Err(TokenError::TokenFormat);
    }
    Ok((header_b64, claims_b64, sig_b64))
}

fn mac(secret: &[u8], signing_input: &str) -> Result<HmacSha256, TokenError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::Key)?;
    mac.update(signing_input.as_bytes());
    Ok(mac)
}

/// Sign claims into a compact HS256 token.
///
/// # Errors
/// Returns an error if the claims cannot be encoded.
pub fn sign_hs256(secret: &[u8], claims: &Claims) -> Result<String, TokenError> {
    let header_b64 = b64e_json(&TokenHeader::hs256())?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature = mac(secret, &signing_input)?.finalize().into_bytes();
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature);
    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Read `jti`, `iat` and `exp` without trusting the token.
///
/// Claims of the wrong type read as missing; only a broken structure is an error.
///
/// # Errors
/// Returns an error if the token is not three base64url JSON segments.
pub fn decode_unverified(token: &str) -> Result<UnverifiedClaims, TokenError> {
    let (header_b64, claims_b64, _) = split(token)?;
    let _: serde_json::Map<String, serde_json::Value> = b64d_json(header_b64)?;
    let claims: serde_json::Map<String, serde_json::Value> = b64d_json(claims_b64)?;
    Ok(UnverifiedClaims {
        jti: claims
            .get("jti")
            .and_then(serde_json::Value::as_str)
            .filter(|jti| !jti.is_empty())
            .map(ToString::to_string),
        iat: claims.get("iat").and_then(serde_json::Value::as_i64),
        exp: claims.get("exp").and_then(serde_json::Value::as_i64),
    })
}

/// Verify algorithm, signature and issuer, then return the claims.
///
/// Expiry is not checked here.
///
/// # Errors
/// Returns an error if the algorithm is not allowed, the signature does not
/// match, the claims are malformed or the issuer differs.
pub fn verify_hs256(token: &str, secret: &[u8], expected_issuer: &str) -> Result<Claims, TokenError> {
    let (header_b64, claims_b64, sig_b64) = split(token)?;

    let header: TokenHeader = b64d_json(header_b64)?;
    if !ALLOWED_ALGORITHMS.contains(&header.alg.as_str()) {
        return Err(TokenError::UnsupportedAlg(header.alg));
    }

    let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
    let signing_input = format!("{header_b64}.{claims_b64}");
    mac(secret, &signing_input)?
        .verify_slice(&signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let claims: Claims = b64d_json(claims_b64)?;
    if claims.iss != expected_issuer {
        return Err(TokenError::InvalidIssuer);
    }
    Ok(claims)
}
