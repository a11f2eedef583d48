//! Cookie and header helpers shared by the HTTP surface.

use axum::http::{
    header::{InvalidHeaderValue, AUTHORIZATION, COOKIE},
    HeaderMap, HeaderValue,
};
use std::net::IpAddr;

pub const AUTH_COOKIE_NAME: &str = "auth_token";

/// `Set-Cookie` value that removes the auth cookie from the client.
pub const CLEARED_AUTH_COOKIE: &str =
    "auth_token=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0";

/// Build the `auth_token` cookie. It is always `Secure`.
pub fn auth_cookie(token: &str, max_age_seconds: u64) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!(
        "{AUTH_COOKIE_NAME}={token}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age={max_age_seconds}"
    ))
}

/// Read a cookie value by name from the `Cookie` header(s).
#[must_use]
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next().unwrap_or_default().trim();
            let Some(val) = parts.next() else {
                continue;
            };
            let val = val.trim();
            if key == name && !val.is_empty() {
                return Some(val.to_string());
            }
        }
    }
    None
}

#[must_use]
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// The cookie wins over the `Authorization` header.
#[must_use]
pub fn extract_auth_token(headers: &HeaderMap) -> Option<String> {
    read_cookie(headers, AUTH_COOKIE_NAME).or_else(|| extract_bearer_token(headers))
}

/// Client address used to key login limits.
///
/// Forwarding headers are only honoured when `trust_proxy_headers` is set.
/// Otherwise, or when they are absent, the peer address of the connection is used.
#[must_use]
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trust_proxy_headers: bool,
) -> Option<String> {
    let forwarded = if trust_proxy_headers {
        extract_client_ip(headers)
    } else {
        None
    };
    forwarded.or_else(|| peer.map(|ip| ip.to_string()))
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`.
#[must_use]
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = value.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
