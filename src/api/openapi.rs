use super::handlers::{auth, csrf, health, types};
use crate::auth::{error::ErrorBody, error::ErrorDetail, RevocationSummary, Role};
use utoipa::{
    openapi::{InfoBuilder, License},
    OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        csrf::csrf_token,
        auth::login,
        auth::logout,
        auth::session,
        auth::change_password,
        auth::revoke_user,
        auth::revoke_all,
    ),
    components(schemas(
        health::Health,
        types::LoginRequest,
        types::LoginResponse,
        types::LoginUser,
        types::SessionResponse,
        types::SessionUser,
        types::ChangePasswordRequest,
        types::RevokeUserRequest,
        types::CsrfTokenResponse,
        RevocationSummary,
        Role,
        ErrorBody,
        ErrorDetail,
    )),
    tags(
        (name = "health", description = "Liveness and build information"),
        (name = "auth", description = "Login, sessions, CSRF and token revocation")
    )
)]
pub struct ApiDoc;

/// The served `OpenAPI` document, with info taken from Cargo metadata.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();

    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    info.license = optional_str(env!("CARGO_PKG_LICENSE")).map(|identifier| {
        let mut license = License::new(identifier);
        license.identifier = Some(identifier.to_string());
        license
    });
    doc.info = info;

    doc
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
