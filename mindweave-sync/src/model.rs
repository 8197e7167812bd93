//! Core data model shared by the server, the client agent and the stores.
//!
//! ```text
//! Document ──owns──► Change (v1) ─► Change (v2) ─► … ─► Change (vN = version)
//!    │
//!    ├── Collaborator records   (durable, access levels)
//!    └── ShareLink records      (durable, inert after expiry/deactivation)
//!
//! PresenceEntry                 (ephemeral, lives in the broadcast channel)
//! PendingChange                 (client-side, not yet versioned)
//! ```
//!
//! Change payloads are opaque: the sync core orders and relays them but never
//! looks inside.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::SystemTime;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Access level of a collaborator on a document.
///
/// Ordered `View < Edit < Owner` so that `level >= AccessLevel::Edit`
/// reads as "may write".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    View,
    Edit,
    Owner,
}

impl AccessLevel {
    /// Whether this level may submit changes.
    pub fn can_write(self) -> bool {
        self >= AccessLevel::Edit
    }

    /// Whether this level may create share links and manage collaborators.
    pub fn can_manage(self) -> bool {
        self == AccessLevel::Owner
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::View => "view",
            AccessLevel::Edit => "edit",
            AccessLevel::Owner => "owner",
        }
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(AccessLevel::View),
            "edit" => Ok(AccessLevel::Edit),
            "owner" => Ok(AccessLevel::Owner),
            other => Err(format!("unknown access level '{other}'")),
        }
    }
}

/// Authenticated principal, supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(id: Uuid, email: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            display_name: display_name.into(),
        }
    }

    /// Fresh identity with a random id (tests and demos).
    pub fn random(display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        let email = format!("{}@example.invalid", display_name.to_lowercase());
        Self::new(Uuid::new_v4(), email, display_name)
    }
}

/// A collaboratively edited document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub creator: Uuid,
    pub collaborators: BTreeSet<Uuid>,
    /// Version after the last accepted change (0 = no changes yet).
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Document {
    pub fn new(title: impl Into<String>, creator: Uuid) -> Self {
        let now = now_millis();
        let mut collaborators = BTreeSet::new();
        collaborators.insert(creator);
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            creator,
            collaborators,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One immutable, versioned edit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: Uuid,
    pub doc_id: Uuid,
    pub author: Uuid,
    pub timestamp: u64,
    /// Version the document takes on after this change.
    pub version: u64,
    pub payload: Vec<u8>,
}

/// A local edit that has not been assigned a version yet.
///
/// The id survives acceptance: the stored [`Change`] carries the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: Uuid,
    pub payload: Vec<u8>,
    pub created_at: u64,
}

impl PendingChange {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            created_at: now_millis(),
        }
    }

    /// Turn into a stored change at `version`.
    pub fn into_change(self, doc_id: Uuid, author: Uuid, version: u64, timestamp: u64) -> Change {
        Change {
            id: self.id,
            doc_id,
            author,
            timestamp,
            version,
            payload: self.payload,
        }
    }
}

/// Durable access-level record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub user_id: Uuid,
    pub doc_id: Uuid,
    pub access: AccessLevel,
    pub added_by: Uuid,
    pub added_at: u64,
}

/// Ephemeral record of a live connection to a document channel.
///
/// Shares only the user id with [`Collaborator`]; dropped the moment the
/// connection goes away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub session_id: Uuid,
    pub identity: Identity,
    pub access: AccessLevel,
    pub joined_at: u64,
    pub last_active: u64,
}

impl PresenceEntry {
    pub fn new(session_id: Uuid, identity: Identity, access: AccessLevel) -> Self {
        let now = now_millis();
        Self {
            session_id,
            identity,
            access,
            joined_at: now,
            last_active: now,
        }
    }
}

/// Link granting access to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLink {
    pub id: Uuid,
    pub doc_id: Uuid,
    pub access: AccessLevel,
    pub created_by: Uuid,
    pub created_at: u64,
    /// Millisecond timestamp after which the link is inert (`None` = never).
    pub expires_at: Option<u64>,
    pub active: bool,
}

impl ShareLink {
    /// Whether the link may still be redeemed at `now`.
    pub fn is_usable(&self, now: u64) -> bool {
        self.active && self.expires_at.map_or(true, |exp| now < exp)
    }
}
