//! # oplog (authentication & session revocation core)
//!
//! `oplog` guards the operations logging service. It verifies credentials,
//! issues signed session tokens, tracks every live token server-side so it can
//! be revoked, refreshes tokens that are close to expiry, and enforces CSRF and
//! brute-force protections on the HTTP surface.
//!
//! ## Sessions
//!
//! Tokens are HS256 JWTs. A token is only accepted while its session record
//! (`session:{jti}`) exists in the session store; deleting the record revokes
//! the token even though its signature stays valid. Tokens are bound to the
//! process that issued them, so a restart forces everyone to log in again.
//!
//! - **Refresh:** once 75% of a token lifetime has elapsed the next verified
//!   request receives a replacement token. The old token keeps working for a
//!   short grace window so in-flight requests are not cut off.
//! - **Revocation:** single token, every token of a user, or every token in
//!   the system.
//!
//! ## Credentials
//!
//! Two roles exist (`admin`, `user`). Until a user sets a personal password,
//! the shared initial passwords apply and login reports
//! `requiresPasswordChange`. A personal password fully replaces the shared
//! one for that username.
//!
//! ## CSRF
//!
//! Double-submit cookie (`_csrf` cookie + `X-CSRF-Token` header) for every
//! state-changing request, except API-key ingestion paths.

pub mod api;
pub mod auth;
pub mod cli;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }
}
