//! Session endpoints under `/api/auth`.
//!
//! `login` is public; everything else runs behind [`crate::api::middleware::authenticate`],
//! which attaches the [`Principal`] and any token minted by auto-refresh.

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Extension},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use secrecy::SecretString;
use std::{net::SocketAddr, sync::Arc};
use tracing::instrument;

use super::types::{
    ChangePasswordRequest, LoginRequest, LoginResponse, LoginUser, RevokeUserRequest,
    SessionResponse,
};
use crate::{
    api::middleware::RefreshedToken,
    auth::{
        error::ErrorBody,
        headers::{auth_cookie, client_ip, CLEARED_AUTH_COOKIE},
        issuer::unix_now,
        AuthError, AuthService, IssuedToken, Principal, RevocationSummary,
    },
};

fn payload<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    payload
        .map(|Json(payload)| payload)
        .map_err(|rejection| AuthError::Validation(rejection.body_text()))
}

fn with_auth_cookie(mut response: Response, token: &IssuedToken) -> Result<Response, AuthError> {
    let cookie = auth_cookie(&token.token, token.max_age_seconds(unix_now()))
        .map_err(|err| AuthError::Internal(err.into()))?;
    response.headers_mut().append(SET_COOKIE, cookie);
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in, auth_token cookie set", body = LoginResponse),
        (status = 400, description = "Missing or malformed credentials", body = ErrorBody),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 429, description = "Too many attempts from this client", body = ErrorBody),
        (status = 503, description = "Session store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Extension(service): Extension<Arc<AuthService>>,
    request: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, AuthError> {
    let request = payload(request)?;
    let password = SecretString::from(request.password);
    let client_ip = client_ip(
        &headers,
        peer.map(|ConnectInfo(addr)| addr.ip()),
        service.config().trust_proxy_headers(),
    );

    let outcome = service
        .login(&request.username, &password, client_ip.as_deref())
        .await?;

    let body = LoginResponse {
        user: LoginUser {
            username: outcome.identity.username,
            role: outcome.identity.role,
            requires_password_change: outcome.requires_password_change,
        },
    };
    with_auth_cookie(Json(body).into_response(), &outcome.token)
}

#[utoipa::path(
    post,
    path = "/api/auth/logout",
    responses(
        (status = 204, description = "Token revoked and cookie cleared"),
        (status = 401, description = "Missing or rejected token", body = ErrorBody),
        (status = 503, description = "Session store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all, fields(username = %principal.username))]
pub async fn logout(
    Extension(service): Extension<Arc<AuthService>>,
    Extension(principal): Extension<Principal>,
    Extension(RefreshedToken(refreshed)): Extension<RefreshedToken>,
) -> Result<Response, AuthError> {
    service.logout(&principal, refreshed.as_ref()).await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    response
        .headers_mut()
        .append(SET_COOKIE, HeaderValue::from_static(CLEARED_AUTH_COOKIE));
    Ok(response)
}

#[utoipa::path(
    get,
    path = "/api/auth/session",
    responses(
        (status = 200, description = "Current session", body = SessionResponse),
        (status = 401, description = "Missing or rejected token", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn session(Extension(principal): Extension<Principal>) -> impl IntoResponse {
    Json(SessionResponse {
        user: principal.identity().into(),
    })
}

#[utoipa::path(
    post,
    path = "/api/auth/change-password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed, fresh auth_token cookie set", body = SessionResponse),
        (status = 400, description = "New password rejected", body = ErrorBody),
        (status = 401, description = "Current password or token rejected", body = ErrorBody),
        (status = 503, description = "Session store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all, fields(username = %principal.username))]
pub async fn change_password(
    Extension(service): Extension<Arc<AuthService>>,
    Extension(principal): Extension<Principal>,
    Extension(RefreshedToken(refreshed)): Extension<RefreshedToken>,
    request: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<Response, AuthError> {
    let request = payload(request)?;
    let current = SecretString::from(request.current_password);
    let new = SecretString::from(request.new_password);

    let token = service
        .change_password(&principal, refreshed.as_ref(), &current, &new)
        .await?;

    let body = SessionResponse {
        user: principal.identity().into(),
    };
    with_auth_cookie(Json(body).into_response(), &token)
}

#[utoipa::path(
    post,
    path = "/api/auth/revoke-user",
    request_body = RevokeUserRequest,
    responses(
        (status = 200, description = "Every token of the user revoked", body = RevocationSummary),
        (status = 400, description = "Invalid username", body = ErrorBody),
        (status = 403, description = "Caller is not an admin", body = ErrorBody),
        (status = 503, description = "Session store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all, fields(admin = %principal.username))]
pub async fn revoke_user(
    Extension(service): Extension<Arc<AuthService>>,
    Extension(principal): Extension<Principal>,
    request: Result<Json<RevokeUserRequest>, JsonRejection>,
) -> Result<Json<RevocationSummary>, AuthError> {
    let request = payload(request)?;
    let summary = service
        .revoke_user(&principal, request.username.trim())
        .await?;
    Ok(Json(summary))
}

#[utoipa::path(
    post,
    path = "/api/auth/revoke-all",
    responses(
        (status = 200, description = "Every session revoked, fresh auth_token cookie set for the caller", body = RevocationSummary),
        (status = 403, description = "Caller is not an admin", body = ErrorBody),
        (status = 503, description = "Session store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all, fields(admin = %principal.username))]
pub async fn revoke_all(
    Extension(service): Extension<Arc<AuthService>>,
    Extension(principal): Extension<Principal>,
) -> Result<Response, AuthError> {
    let (summary, token) = service.revoke_all(&principal).await?;
    with_auth_cookie(Json(summary).into_response(), &token)
}
