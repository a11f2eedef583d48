//! Auth runtime configuration and secrets.

use secrecy::SecretString;
use std::time::Duration;
use url::Url;

use super::{
    password::DEFAULT_ITERATIONS,
    rate_limit::{
        RateLimitWindow, DEFAULT_LOGIN_MAX_ATTEMPTS, DEFAULT_REFRESH_MAX_ATTEMPTS, DEFAULT_WINDOW,
    },
};
use crate::store::RetryPolicy;

const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(8 * 60 * 60);
const DEFAULT_REFRESH_THRESHOLD: f64 = 0.75;
const DEFAULT_REFRESH_GRACE: Duration = Duration::from_secs(30);
const DEFAULT_FAILED_LOGIN_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_KDF_CONCURRENCY: usize = 4;
const DEFAULT_PUBLIC_URL: &str = "https://localhost";
pub const DEFAULT_CSRF_EXEMPT_PREFIX: &str = "/api/ingest";
pub const MIN_JWT_SECRET_BYTES: usize = 32;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    public_url: String,
    token_ttl: Duration,
    refresh_threshold: f64,
    refresh_grace: Duration,
    login_limit: RateLimitWindow,
    refresh_limit: RateLimitWindow,
    failed_login_delay: Duration,
    pbkdf2_iterations: u32,
    kdf_concurrency: usize,
    csrf_exempt_prefixes: Vec<String>,
    trust_proxy_headers: bool,
    store_retry: RetryPolicy,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PUBLIC_URL.to_string())
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new(public_url: String) -> Self {
        Self {
            public_url,
            token_ttl: DEFAULT_TOKEN_TTL,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            refresh_grace: DEFAULT_REFRESH_GRACE,
            login_limit: RateLimitWindow::new(DEFAULT_LOGIN_MAX_ATTEMPTS, DEFAULT_WINDOW),
            refresh_limit: RateLimitWindow::new(DEFAULT_REFRESH_MAX_ATTEMPTS, DEFAULT_WINDOW),
            failed_login_delay: DEFAULT_FAILED_LOGIN_DELAY,
            pbkdf2_iterations: DEFAULT_ITERATIONS,
            kdf_concurrency: DEFAULT_KDF_CONCURRENCY,
            csrf_exempt_prefixes: vec![DEFAULT_CSRF_EXEMPT_PREFIX.to_string()],
            trust_proxy_headers: false,
            store_retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Fraction of the lifetime after which a token is refreshed, clamped to `0..=1`.
    #[must_use]
    pub fn with_refresh_threshold(mut self, threshold: f64) -> Self {
        self.refresh_threshold = if threshold.is_finite() {
            threshold.clamp(0.0, 1.0)
        } else {
            DEFAULT_REFRESH_THRESHOLD
        };
        self
    }

    #[must_use]
    pub fn with_refresh_grace(mut self, grace: Duration) -> Self {
        self.refresh_grace = grace;
        self
    }

    #[must_use]
    pub fn with_login_limit(mut self, limit: RateLimitWindow) -> Self {
        self.login_limit = limit;
        self
    }

    #[must_use]
    pub fn with_refresh_limit(mut self, limit: RateLimitWindow) -> Self {
        self.refresh_limit = limit;
        self
    }

    #[must_use]
    pub fn with_failed_login_delay(mut self, delay: Duration) -> Self {
        self.failed_login_delay = delay;
        self
    }

    #[must_use]
    pub fn with_pbkdf2_iterations(mut self, iterations: u32) -> Self {
        self.pbkdf2_iterations = iterations;
        self
    }

    #[must_use]
    pub fn with_kdf_concurrency(mut self, concurrency: usize) -> Self {
        self.kdf_concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_csrf_exempt_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.csrf_exempt_prefixes = prefixes;
        self
    }

    /// Take the login client IP from forwarding headers instead of the peer
    /// address. Only safe behind a reverse proxy that overwrites them.
    #[must_use]
    pub fn with_trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    #[must_use]
    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    #[must_use]
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    #[must_use]
    pub fn refresh_threshold(&self) -> f64 {
        self.refresh_threshold
    }

    #[must_use]
    pub fn refresh_grace(&self) -> Duration {
        self.refresh_grace
    }

    #[must_use]
    pub fn login_limit(&self) -> RateLimitWindow {
        self.login_limit
    }

    #[must_use]
    pub fn refresh_limit(&self) -> RateLimitWindow {
        self.refresh_limit
    }

    #[must_use]
    pub fn failed_login_delay(&self) -> Duration {
        self.failed_login_delay
    }

    #[must_use]
    pub fn pbkdf2_iterations(&self) -> u32 {
        self.pbkdf2_iterations
    }

    #[must_use]
    pub fn kdf_concurrency(&self) -> usize {
        self.kdf_concurrency
    }

    #[must_use]
    pub fn csrf_exempt_prefixes(&self) -> &[String] {
        &self.csrf_exempt_prefixes
    }

    #[must_use]
    pub fn trust_proxy_headers(&self) -> bool {
        self.trust_proxy_headers
    }

    #[must_use]
    pub fn store_retry(&self) -> RetryPolicy {
        self.store_retry
    }

    /// The `_csrf` cookie is only marked `Secure` when the app is served over HTTPS.
    #[must_use]
    pub fn csrf_cookie_secure(&self) -> bool {
        Url::parse(&self.public_url).map_or(true, |url| url.scheme() == "https")
    }
}

/// Signing key and the shared initial passwords.
#[derive(Debug)]
pub struct AuthSecrets {
    pub jwt_secret: SecretString,
    pub admin_password: SecretString,
    pub user_password: SecretString,
}

impl AuthSecrets {
    #[must_use]
    pub fn new(
        jwt_secret: SecretString,
        admin_password: SecretString,
        user_password: SecretString,
    ) -> Self {
        Self {
            jwt_secret,
            admin_password,
            user_password,
        }
    }
}
