use crate::{
    api,
    auth::{AuthConfig, AuthSecrets, AuthService, RateLimitWindow},
    cli::commands::auth::Options,
    store::{MemoryStore, PgStore, SessionStore},
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub auth: Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the session store cannot be reached, the signing secret
/// is too short, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let backend: Arc<dyn SessionStore> = match &args.dsn {
        Some(dsn) => Arc::new(
            PgStore::connect(dsn)
                .await
                .context("Could not connect to the session store")?,
        ),
        None => {
            warn!("No DSN configured, sessions are kept in process memory");
            Arc::new(MemoryStore::new())
        }
    };

    let config = auth_config(&args.auth);
    let secrets = AuthSecrets::new(
        args.auth.jwt_secret,
        args.auth.admin_password,
        args.auth.user_password,
    );

    let service = AuthService::builder(config, secrets, backend)
        .build()
        .await
        .context("Failed to initialize the auth service")?;

    api::serve(args.port, Arc::new(service)).await
}

fn auth_config(options: &Options) -> AuthConfig {
    let window = Duration::from_secs(options.login_window_seconds);
    AuthConfig::new(options.public_url.clone())
        .with_token_ttl(Duration::from_secs(options.token_ttl_seconds))
        .with_refresh_threshold(options.refresh_threshold)
        .with_refresh_grace(Duration::from_secs(options.refresh_grace_seconds))
        .with_login_limit(RateLimitWindow::new(options.login_max_attempts, window))
        .with_refresh_limit(RateLimitWindow::new(options.refresh_max_attempts, window))
        .with_failed_login_delay(Duration::from_millis(options.failed_login_delay_ms))
        .with_pbkdf2_iterations(options.pbkdf2_iterations)
        .with_csrf_exempt_prefixes(options.csrf_exempt_prefixes.clone())
        .with_trust_proxy_headers(options.trust_proxy_headers)
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "session_store",
            args.dsn
                .as_deref()
                .map_or_else(|| "memory".to_string(), redact_dsn),
        ),
        ("public_url", args.auth.public_url.clone()),
        ("token_ttl_seconds", args.auth.token_ttl_seconds.to_string()),
        ("refresh_threshold", args.auth.refresh_threshold.to_string()),
        (
            "refresh_grace_seconds",
            args.auth.refresh_grace_seconds.to_string(),
        ),
        (
            "login_limit",
            format!(
                "{}/{}s",
                args.auth.login_max_attempts, args.auth.login_window_seconds
            ),
        ),
        (
            "trust_proxy_headers",
            args.auth.trust_proxy_headers.to_string(),
        ),
        (
            "csrf_exempt_prefixes",
            args.auth.csrf_exempt_prefixes.join(","),
        ),
    ];

    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {} ({})\n\nStartup configuration:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        message.push_str(&format!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
