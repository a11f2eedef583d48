//! Security audit events.
//!
//! Event details are redacted before they reach a sink: any object key that
//! looks like a credential is replaced, at any depth.

use serde_json::{Map, Value};
use std::sync::Mutex;
use tracing::info;

pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "password",
    "token",
    "secret",
    "cookie",
    "authorization",
    "proof",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditKind {
    LoginSucceeded,
    LoginFailed,
    Logout,
    PasswordChanged,
    TokenRefreshed,
    TokenRevoked,
    UserTokensRevoked,
    AllTokensRevoked,
}

impl AuditKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoginSucceeded => "login_succeeded",
            Self::LoginFailed => "login_failed",
            Self::Logout => "logout",
            Self::PasswordChanged => "password_changed",
            Self::TokenRefreshed => "token_refreshed",
            Self::TokenRevoked => "token_revoked",
            Self::UserTokensRevoked => "user_tokens_revoked",
            Self::AllTokensRevoked => "all_tokens_revoked",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub username: Option<String>,
    pub ip: Option<String>,
    pub success: bool,
    pub details: Value,
}

impl AuditEvent {
    #[must_use]
    pub fn new(kind: AuditKind) -> Self {
        Self {
            kind,
            username: None,
            ip: None,
            success: true,
            details: Value::Object(Map::new()),
        }
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_ip(mut self, ip: Option<&str>) -> Self {
        self.ip = ip.map(ToString::to_string);
        self
    }

    #[must_use]
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn redacted(mut self) -> Self {
        redact(&mut self.details);
        self
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| key.contains(fragment))
}

/// Replace every sensitive value in place, recursing into objects and arrays.
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map.iter_mut() {
                if is_sensitive(key) {
                    *nested = Value::String(REDACTED.to_string());
                } else {
                    redact(nested);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events to the `oplog::audit` tracing target.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "oplog::audit",
            event = event.kind.as_str(),
            username = event.username.as_deref().unwrap_or("-"),
            ip = event.ip.as_deref().unwrap_or("-"),
            success = event.success,
            details = %event.details,
            "audit"
        );
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_sensitive_keys_at_any_depth() {
        let mut details = json!({
            "username": "alice",
            "password": "hunter22",
            "nested": {
                "newPassword": "x",
                "Authorization": "Bearer abc",
                "items": [{ "csrfToken": "t", "count": 2 }]
            },
            "adminProof": "deadbeef",
            "jwt_secret": "s",
            "session_cookie": "c"
        });
        redact(&mut details);
        assert_eq!(
            details,
            json!({
                "username": "alice",
                "password": REDACTED,
                "nested": {
                    "newPassword": REDACTED,
                    "Authorization": REDACTED,
                    "items": [{ "csrfToken": REDACTED, "count": 2 }]
                },
                "adminProof": REDACTED,
                "jwt_secret": REDACTED,
                "session_cookie": REDACTED
            })
        );
    }

    #[test]
    fn memory_sink_keeps_events_in_order() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::new(AuditKind::LoginFailed).with_success(false));
        sink.record(
            AuditEvent::new(AuditKind::Logout)
                .with_username("alice")
                .with_ip(Some("203.0.113.7")),
        );
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AuditKind::LoginFailed);
        assert!(!events[0].success);
        assert_eq!(events[1].username.as_deref(), Some("alice"));
        assert_eq!(events[1].ip.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn redacted_event_keeps_plain_fields() {
        let event = AuditEvent::new(AuditKind::TokenRevoked)
            .with_details(json!({ "jti": "abc", "token": "raw" }))
            .redacted();
        assert_eq!(event.details, json!({ "jti": "abc", "token": REDACTED }));
    }
}
