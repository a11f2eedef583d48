//! Error taxonomy for the auth core and its HTTP mapping.

use axum::{
    http::{header::SET_COOKIE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

use super::headers::CLEARED_AUTH_COOKIE;
use crate::store::StoreError;

/// Machine readable reason attached to every authentication failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    TokenMissing,
    TokenMalformed,
    TokenInvalid,
    TokenExpired,
    TokenRevoked,
    ServerMismatch,
    TokenVersionMismatch,
    InvalidCredentials,
}

impl RejectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenMissing => "token_missing",
            Self::TokenMalformed => "token_malformed",
            Self::TokenInvalid => "token_invalid",
            Self::TokenExpired => "token_expired",
            Self::TokenRevoked => "token_revoked",
            Self::ServerMismatch => "server_mismatch",
            Self::TokenVersionMismatch => "token_version_mismatch",
            Self::InvalidCredentials => "invalid_credentials",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// JSON body of every error response: `{"error": {"code", "message"}}`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),
    #[error("authentication failed ({code})")]
    Authentication { code: RejectReason },
    #[error("forbidden ({code})")]
    Authorization { code: &'static str },
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    #[must_use]
    pub fn rejected(code: RejectReason) -> Self {
        Self::Authentication { code }
    }

    #[must_use]
    pub fn forbidden() -> Self {
        Self::Authorization { code: "forbidden" }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Code and message safe to hand to a client.
    ///
    /// Authentication failures never say which factor failed, and internal
    /// details only leak in debug builds.
    #[must_use]
    pub fn public_parts(&self) -> (&'static str, String) {
        match self {
            Self::Validation(message) => ("validation_error", message.clone()),
            Self::Authentication { code } => (code.as_str(), "Authentication failed".to_string()),
            Self::Authorization { code } => (code, "Forbidden".to_string()),
            Self::RateLimited => (
                "rate_limited",
                "Too many attempts, please try again later".to_string(),
            ),
            Self::ServiceUnavailable(_) => (
                "service_unavailable",
                "Service temporarily unavailable".to_string(),
            ),
            Self::Internal(err) => {
                let message = if cfg!(debug_assertions) {
                    format!("Internal server error: {err:#}")
                } else {
                    "Internal server error".to_string()
                };
                ("internal_error", message)
            }
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        Self::ServiceUnavailable(err.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match &self {
            Self::ServiceUnavailable(detail) => error!("Session store unavailable: {detail}"),
            Self::Internal(err) => error!("Internal error: {err:#}"),
            _ => {}
        }

        let status = self.status();
        let (code, message) = self.public_parts();
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };
        let mut response = (status, Json(body)).into_response();

        if matches!(self, Self::Authentication { .. }) {
            response
                .headers_mut()
                .append(SET_COOKIE, HeaderValue::from_static(CLEARED_AUTH_COOKIE));
        }

        response
    }
}
