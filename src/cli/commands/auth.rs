//! Session, credential and protection settings.

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

use crate::auth::config::DEFAULT_CSRF_EXEMPT_PREFIX;

pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_ADMIN_PASSWORD: &str = "admin-password";
pub const ARG_USER_PASSWORD: &str = "user-password";
pub const ARG_PUBLIC_URL: &str = "public-url";
pub const ARG_CSRF_EXEMPT_PREFIX: &str = "csrf-exempt-prefix";
pub const ARG_TRUST_PROXY_HEADERS: &str = "trust-proxy-headers";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_secret_args(command);
    let command = with_token_args(command);
    with_protection_args(command)
}

fn with_secret_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("HS256 signing secret, at least 32 bytes")
                .env("OPLOG_JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_ADMIN_PASSWORD)
                .long(ARG_ADMIN_PASSWORD)
                .help("Shared initial password for admin logins")
                .env("OPLOG_ADMIN_PASSWORD")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_USER_PASSWORD)
                .long(ARG_USER_PASSWORD)
                .help("Shared initial password for user logins")
                .env("OPLOG_USER_PASSWORD")
                .hide_env_values(true)
                .required(true),
        )
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PUBLIC_URL)
                .long(ARG_PUBLIC_URL)
                .help("Public URL of the frontend, used for CORS and cookie security")
                .env("OPLOG_PUBLIC_URL")
                .default_value("https://localhost"),
        )
        .arg(
            Arg::new("token-ttl-seconds")
                .long("token-ttl-seconds")
                .help("Session token lifetime in seconds")
                .env("OPLOG_TOKEN_TTL_SECONDS")
                .default_value("28800")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("refresh-threshold")
                .long("refresh-threshold")
                .help("Fraction of the token lifetime after which it is refreshed")
                .env("OPLOG_REFRESH_THRESHOLD")
                .default_value("0.75")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("refresh-grace-seconds")
                .long("refresh-grace-seconds")
                .help("How long a refreshed token keeps working")
                .env("OPLOG_REFRESH_GRACE_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("pbkdf2-iterations")
                .long("pbkdf2-iterations")
                .help("PBKDF2-HMAC-SHA256 iterations for stored passwords")
                .env("OPLOG_PBKDF2_ITERATIONS")
                .default_value("310000")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
}

fn with_protection_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("login-max-attempts")
                .long("login-max-attempts")
                .help("Login attempts allowed per client IP and window")
                .env("OPLOG_LOGIN_MAX_ATTEMPTS")
                .default_value("10")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("login-window-seconds")
                .long("login-window-seconds")
                .help("Rate limit window in seconds")
                .env("OPLOG_LOGIN_WINDOW_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("refresh-max-attempts")
                .long("refresh-max-attempts")
                .help("Token refreshes allowed per user and window")
                .env("OPLOG_REFRESH_MAX_ATTEMPTS")
                .default_value("30")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("failed-login-delay-ms")
                .long("failed-login-delay-ms")
                .help("Delay before answering a failed login, in milliseconds")
                .env("OPLOG_FAILED_LOGIN_DELAY_MS")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_CSRF_EXEMPT_PREFIX)
                .long(ARG_CSRF_EXEMPT_PREFIX)
                .help("Path prefix exempt from CSRF checks (repeatable)")
                .env("OPLOG_CSRF_EXEMPT_PREFIX")
                .value_delimiter(',')
                .action(ArgAction::Append)
                .default_value(DEFAULT_CSRF_EXEMPT_PREFIX),
        )
        .arg(
            Arg::new(ARG_TRUST_PROXY_HEADERS)
                .long(ARG_TRUST_PROXY_HEADERS)
                .help("Key login limits by X-Forwarded-For/X-Real-IP; only behind a trusted reverse proxy")
                .env("OPLOG_TRUST_PROXY_HEADERS")
                .action(ArgAction::SetTrue),
        )
}

#[derive(Debug)]
pub struct Options {
    pub jwt_secret: SecretString,
    pub admin_password: SecretString,
    pub user_password: SecretString,
    pub public_url: String,
    pub token_ttl_seconds: u64,
    pub refresh_threshold: f64,
    pub refresh_grace_seconds: u64,
    pub pbkdf2_iterations: u32,
    pub login_max_attempts: u32,
    pub login_window_seconds: u64,
    pub refresh_max_attempts: u32,
    pub failed_login_delay_ms: u64,
    pub csrf_exempt_prefixes: Vec<String>,
    pub trust_proxy_headers: bool,
}

fn secret(matches: &ArgMatches, name: &str) -> Result<SecretString> {
    matches
        .get_one::<String>(name)
        .cloned()
        .map(SecretString::from)
        .with_context(|| format!("missing required argument: --{name}"))
}

fn value<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, name: &str) -> Result<T> {
    matches
        .get_one::<T>(name)
        .cloned()
        .with_context(|| format!("missing argument: --{name}"))
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            jwt_secret: secret(matches, ARG_JWT_SECRET)?,
            admin_password: secret(matches, ARG_ADMIN_PASSWORD)?,
            user_password: secret(matches, ARG_USER_PASSWORD)?,
            public_url: value(matches, ARG_PUBLIC_URL)?,
            token_ttl_seconds: value(matches, "token-ttl-seconds")?,
            refresh_threshold: value(matches, "refresh-threshold")?,
            refresh_grace_seconds: value(matches, "refresh-grace-seconds")?,
            pbkdf2_iterations: value(matches, "pbkdf2-iterations")?,
            login_max_attempts: value(matches, "login-max-attempts")?,
            login_window_seconds: value(matches, "login-window-seconds")?,
            refresh_max_attempts: value(matches, "refresh-max-attempts")?,
            failed_login_delay_ms: value(matches, "failed-login-delay-ms")?,
            csrf_exempt_prefixes: matches
                .get_many::<String>(ARG_CSRF_EXEMPT_PREFIX)
                .map(|values| values.cloned().collect())
                .unwrap_or_default(),
            trust_proxy_headers: matches.get_flag(ARG_TRUST_PROXY_HEADERS),
        })
    }
}
