//! Request guards: CSRF for every route, token verification for session routes.

use axum::{
    extract::{Extension, Request},
    http::header::SET_COOKIE,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

use crate::auth::{
    csrf,
    headers::{auth_cookie, extract_auth_token, AUTH_COOKIE_NAME},
    issuer::unix_now,
    AuthService, IssuedToken,
};

/// The CSRF token bound to this request's `_csrf` cookie.
#[derive(Clone, Debug)]
pub struct CsrfToken(pub String);

/// Replacement token minted by auto-refresh while verifying this request.
#[derive(Clone, Debug, Default)]
pub struct RefreshedToken(pub Option<IssuedToken>);

pub async fn csrf_guard(
    Extension(service): Extension<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let config = service.config();
    if let Err(err) = csrf::check_request(
        request.method(),
        request.uri().path(),
        request.headers(),
        config.csrf_exempt_prefixes(),
    ) {
        return err.into_response();
    }

    let existing = csrf::csrf_cookie_value(request.headers());
    let minted = match (&existing, csrf::is_safe_method(request.method())) {
        (None, true) => Some(csrf::generate_csrf_token()),
        _ => None,
    };
    if let Some(token) = existing.as_ref().or(minted.as_ref()) {
        request.extensions_mut().insert(CsrfToken(token.clone()));
    }

    let mut response = next.run(request).await;

    if let Some(token) = minted {
        match csrf::csrf_cookie(&token, config.csrf_cookie_secure()) {
            Ok(cookie) => {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            Err(err) => error!("Failed to build CSRF cookie: {err}"),
        }
    }
    response
}

/// Verify the presented token and attach the principal.
///
/// A refreshed token is set on the response unless the handler already set
/// its own auth cookie.
pub async fn authenticate(
    Extension(service): Extension<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = extract_auth_token(request.headers());
    let verified = match service.verify_token(token.as_deref()).await {
        Ok(verified) => verified,
        Err(err) => return err.into_response(),
    };

    request.extensions_mut().insert(verified.principal);
    request
        .extensions_mut()
        .insert(RefreshedToken(verified.refreshed.clone()));

    let mut response = next.run(request).await;

    if let Some(refreshed) = verified.refreshed {
        let cookie_prefix = format!("{AUTH_COOKIE_NAME}=");
        let handler_set_cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.starts_with(&cookie_prefix));
        if !handler_set_cookie {
            match auth_cookie(&refreshed.token, refreshed.max_age_seconds(unix_now())) {
                Ok(cookie) => {
                    response.headers_mut().append(SET_COOKIE, cookie);
                }
                Err(err) => error!("Failed to build refreshed auth cookie: {err}"),
            }
        }
    }
    response
}
