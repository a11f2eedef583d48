//! Identities and the session record stored under `session:{jti}`.

use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

pub const SESSION_RECORD_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a token speaks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
}

impl Identity {
    /// The id is derived from role and username, so it is stable across logins.
    #[must_use]
    pub fn new(username: impl Into<String>, role: Role) -> Self {
        let username = username.into();
        Self {
            id: user_id(&username, role),
            username,
            role,
        }
    }
}

#[must_use]
pub fn user_id(username: &str, role: Role) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("oplog:{}:{username}", role.as_str()).as_bytes(),
    )
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub v: u8,
    pub jti: String,
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
    pub server_instance_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub token_version: u32,
    /// jti of the token that replaced this one; set while the grace window runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

impl SessionRecord {
    /// # Errors
    /// Returns an error if the record cannot be serialized.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a stored record. Anything unreadable counts as absent.
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str::<Self>(raw) {
            Ok(record) if record.v == SESSION_RECORD_VERSION => Some(record),
            Ok(record) => {
                warn!(
                    "Ignoring session record {} with unknown version {}",
                    record.jti, record.v
                );
                None
            }
            Err(err) => {
                warn!("Ignoring undecodable session record: {err}");
                None
            }
        }
    }

    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.user_id,
            username: self.username.clone(),
            role: self.role,
        }
    }
}
