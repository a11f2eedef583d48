//! Rate limiting primitives for login and token refresh.

use dashmap::DashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_REFRESH_MAX_ATTEMPTS: u32 = 30;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Login,
    Refresh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, action: RateLimitAction, key: &str) -> RateLimitDecision;

    /// Evict stale state. Returns how many entries were dropped.
    fn sweep(&self) -> usize {
        0
    }
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _action: RateLimitAction, _key: &str) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub max_attempts: u32,
    pub window: Duration,
}

impl RateLimitWindow {
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Counter {
    count: u32,
    window_start: Instant,
}

/// Fixed-window counters keyed by `(action, key)`.
///
/// Login is keyed by client IP, refresh by username. A counter resets once its
/// window has fully elapsed.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    login: RateLimitWindow,
    refresh: RateLimitWindow,
    counters: DashMap<(RateLimitAction, String), Counter>,
}

impl Default for FixedWindowRateLimiter {
    fn default() -> Self {
        Self::new(
            RateLimitWindow::new(DEFAULT_LOGIN_MAX_ATTEMPTS, DEFAULT_WINDOW),
            RateLimitWindow::new(DEFAULT_REFRESH_MAX_ATTEMPTS, DEFAULT_WINDOW),
        )
    }
}

impl FixedWindowRateLimiter {
    #[must_use]
    pub fn new(login: RateLimitWindow, refresh: RateLimitWindow) -> Self {
        Self {
            login,
            refresh,
            counters: DashMap::new(),
        }
    }

    fn window(&self, action: RateLimitAction) -> RateLimitWindow {
        match action {
            RateLimitAction::Login => self.login,
            RateLimitAction::Refresh => self.refresh,
        }
    }

    pub fn check_at(&self, action: RateLimitAction, key: &str, now: Instant) -> RateLimitDecision {
        let limit = self.window(action);
        let mut counter = self
            .counters
            .entry((action, key.to_string()))
            .or_insert(Counter {
                count: 0,
                window_start: now,
            });

        if now.saturating_duration_since(counter.window_start) >= limit.window {
            counter.count = 0;
            counter.window_start = now;
        }

        if counter.count >= limit.max_attempts {
            return RateLimitDecision::Limited;
        }
        counter.count += 1;
        RateLimitDecision::Allowed
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters.retain(|(action, _), counter| {
            now.saturating_duration_since(counter.window_start) < self.window(*action).window
        });
        before.saturating_sub(self.counters.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn check(&self, action: RateLimitAction, key: &str) -> RateLimitDecision {
        self.check_at(action, key, Instant::now())
    }

    fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }
}
