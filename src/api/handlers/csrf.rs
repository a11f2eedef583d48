use axum::{extract::Extension, response::IntoResponse, Json};

use super::types::CsrfTokenResponse;
use crate::api::middleware::CsrfToken;

/// Hand the CSRF token to the frontend. The cookie itself is set by the
/// CSRF guard when the request did not carry one yet.
#[utoipa::path(
    get,
    path = "/api/csrf-token",
    responses(
        (status = 200, description = "Token matching the _csrf cookie", body = CsrfTokenResponse)
    ),
    tag = "auth"
)]
pub async fn csrf_token(Extension(CsrfToken(token)): Extension<CsrfToken>) -> impl IntoResponse {
    Json(CsrfTokenResponse { csrf_token: token })
}
