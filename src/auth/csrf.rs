//! Double-submit cookie CSRF protection.
//!
//! The `_csrf` cookie is minted on safe requests and is independent of any
//! session. State-changing requests must echo it in `CSRF-Token` or
//! `X-CSRF-Token`. A successful check never rotates the token, so concurrent
//! requests holding the same value all pass.

use axum::http::{header::InvalidHeaderValue, HeaderMap, HeaderValue, Method};
use rand::{rngs::OsRng, RngCore};
use std::time::Duration;
use subtle::ConstantTimeEq;

use super::{error::AuthError, headers::read_cookie};

pub const CSRF_COOKIE_NAME: &str = "_csrf";
pub const CSRF_HEADER_NAMES: [&str; 2] = ["csrf-token", "x-csrf-token"];
pub const CSRF_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);
const CSRF_TOKEN_BYTES: usize = 32;

#[must_use]
pub fn generate_csrf_token() -> String {
    let mut bytes = [0u8; CSRF_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Build the `_csrf` cookie; `Secure` only when served over HTTPS.
pub fn csrf_cookie(token: &str, secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{CSRF_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        CSRF_TOKEN_TTL.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

#[must_use]
pub fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

#[must_use]
pub fn is_exempt(path: &str, exempt_prefixes: &[String]) -> bool {
    exempt_prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
}

#[must_use]
pub fn csrf_cookie_value(headers: &HeaderMap) -> Option<String> {
    read_cookie(headers, CSRF_COOKIE_NAME)
}

#[must_use]
pub fn csrf_header_value(headers: &HeaderMap) -> Option<String> {
    CSRF_HEADER_NAMES.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    })
}

#[must_use]
pub fn tokens_match(cookie: &str, header: &str) -> bool {
    cookie.as_bytes().ct_eq(header.as_bytes()).into()
}

/// Enforce the double-submit check for one request.
///
/// # Errors
/// Returns a 403 [`AuthError::Authorization`] when an unsafe, non-exempt
/// request lacks the header or the header differs from the cookie.
pub fn check_request(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    exempt_prefixes: &[String],
) -> Result<(), AuthError> {
    if is_safe_method(method) || is_exempt(path, exempt_prefixes) {
        return Ok(());
    }

    let cookie = csrf_cookie_value(headers);
    let header = csrf_header_value(headers);
    match (cookie, header) {
        (Some(cookie), Some(header)) if tokens_match(&cookie, &header) => Ok(()),
        _ => Err(AuthError::Authorization {
            code: "csrf_invalid",
        }),
    }
}
