//! Binary wire protocol between the client agent and the live server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! [`SyncMessage`].
//!
//! ```text
//! client                                   server
//!   │── Join { doc, credentials, last_v } ──►│
//!   │◄─ Joined { session, v, missed, who } ──│
//!   │── Submit { req, base, changes } ──────►│
//!   │◄─ ChangeAccepted { req, v, count } ────│   or
//!   │◄─ ChangeRejected { req, v, server } ───│
//!   │◄─ RemoteChange(change) ────────────────│   (other writers)
//!   │◄─ PresenceUpdate { kind, entry } ──────│
//!   │── CatchUp { since } ──────────────────►│
//!   │◄─ CaughtUp { v, changes } ─────────────│
//!   │◄─ Ping { nonce } / ── Pong { nonce } ─►│   (either direction)
//!   │◄─ Error { kind, message, v? } ─────────│
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use uuid::Uuid;

use crate::error::{ErrorKind, SyncError};
use crate::identity::Credentials;
use crate::model::{AccessLevel, Change, PendingChange, PresenceEntry};
use crate::presence::PresenceKind;

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// First frame of every connection. `last_version` is the client's base
    /// (0 for a fresh client).
    Join {
        doc_id: Uuid,
        credentials: Credentials,
        last_version: u64,
    },

    Joined {
        session_id: Uuid,
        access: AccessLevel,
        current_version: u64,
        /// Changes in `(last_version, current_version]`.
        missed: Vec<Change>,
        presence: Vec<PresenceEntry>,
    },

    Submit {
        request_id: Uuid,
        base_version: u64,
        changes: Vec<PendingChange>,
    },

    ChangeAccepted {
        request_id: Uuid,
        version: u64,
        count: u64,
    },

    ChangeRejected {
        request_id: Uuid,
        current_version: u64,
        server_changes: Vec<Change>,
    },

    /// A change accepted from another session or over HTTP.
    RemoteChange(Change),

    PresenceUpdate {
        kind: PresenceKind,
        entry: PresenceEntry,
    },

    CatchUp {
        since: u64,
    },

    CaughtUp {
        current_version: u64,
        changes: Vec<Change>,
    },

    Ping {
        nonce: u64,
    },

    Pong {
        nonce: u64,
    },

    Error {
        kind: ErrorKind,
        message: String,
        current_version: Option<u64>,
    },
}

impl SyncMessage {
    pub fn join(doc_id: Uuid, credentials: Credentials, last_version: u64) -> Self {
        SyncMessage::Join {
            doc_id,
            credentials,
            last_version,
        }
    }

    pub fn submit(base_version: u64, changes: Vec<PendingChange>) -> Self {
        SyncMessage::Submit {
            request_id: Uuid::new_v4(),
            base_version,
            changes,
        }
    }

    pub fn error(err: &SyncError) -> Self {
        SyncMessage::Error {
            kind: err.kind(),
            message: err.to_string(),
            current_version: err.current_version(),
        }
    }

    /// Rebuild the error carried by an `Error` frame.
    pub fn into_error(self) -> Option<SyncError> {
        match self {
            SyncMessage::Error {
                kind,
                message,
                current_version,
            } => Some(SyncError::from_wire(kind, message, current_version)),
            _ => None,
        }
    }

    /// Variant name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::Join { .. } => "Join",
            SyncMessage::Joined { .. } => "Joined",
            SyncMessage::Submit { .. } => "Submit",
            SyncMessage::ChangeAccepted { .. } => "ChangeAccepted",
            SyncMessage::ChangeRejected { .. } => "ChangeRejected",
            SyncMessage::RemoteChange(_) => "RemoteChange",
            SyncMessage::PresenceUpdate { .. } => "PresenceUpdate",
            SyncMessage::CatchUp { .. } => "CatchUp",
            SyncMessage::CaughtUp { .. } => "CaughtUp",
            SyncMessage::Ping { .. } => "Ping",
            SyncMessage::Pong { .. } => "Pong",
            SyncMessage::Error { .. } => "Error",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Unexpected message: {0}")]
    Unexpected(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => ProtocolError::ConnectionClosed,
            other => ProtocolError::WebSocket(other.to_string()),
        }
    }
}

/// Size limits shared by both ends of a connection.
///
/// A frame carries at most `max_batch_len` changes and, unless it holds a
/// single change, at most `max_batch_bytes` of payload. Batches and replays
/// larger than that are split across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_batch_len: usize,
    pub max_payload_bytes: usize,
    pub max_batch_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_batch_len: 1024,
            max_payload_bytes: 1024 * 1024,
            max_batch_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Limits {
    /// Reject a single edit that no server would accept.
    pub fn check_payload(&self, payload: &[u8]) -> Result<(), SyncError> {
        if payload.len() > self.max_payload_bytes {
            return Err(SyncError::ValidationFailure(format!(
                "payload of {} bytes exceeds limit of {}",
                payload.len(),
                self.max_payload_bytes
            )));
        }
        Ok(())
    }

    pub fn check_batch(&self, changes: &[PendingChange]) -> Result<(), SyncError> {
        if changes.is_empty() {
            return Err(SyncError::ValidationFailure("empty change batch".into()));
        }
        if changes.len() > self.max_batch_len {
            return Err(SyncError::ValidationFailure(format!(
                "batch of {} changes exceeds limit of {}",
                changes.len(),
                self.max_batch_len
            )));
        }
        if let Some(big) = changes.iter().find(|c| c.payload.len() > self.max_payload_bytes) {
            return Err(SyncError::ValidationFailure(format!(
                "change {} payload of {} bytes exceeds limit of {}",
                big.id,
                big.payload.len(),
                self.max_payload_bytes
            )));
        }
        let total: usize = changes.iter().map(|c| c.payload.len()).sum();
        if changes.len() > 1 && total > self.max_batch_bytes {
            return Err(SyncError::ValidationFailure(format!(
                "batch of {total} payload bytes exceeds limit of {}",
                self.max_batch_bytes
            )));
        }
        Ok(())
    }

    /// How many leading items of the given payload sizes fit one frame.
    /// At least one when `sizes` is non-empty.
    pub fn fitting<I>(&self, sizes: I) -> usize
    where
        I: IntoIterator<Item = usize>,
    {
        let mut count = 0;
        let mut total = 0usize;
        for size in sizes {
            if count == self.max_batch_len {
                break;
            }
            if count > 0 && total.saturating_add(size) > self.max_batch_bytes {
                break;
            }
            total = total.saturating_add(size);
            count += 1;
        }
        count
    }

    /// Leading run of `changes` that fits one frame.
    pub fn page(&self, mut changes: Vec<Change>) -> Vec<Change> {
        let count = self.fitting(changes.iter().map(|c| c.payload.len()));
        changes.truncate(count);
        changes
    }

    /// Largest WebSocket message either end accepts: a full page plus
    /// room for change and presence metadata.
    pub fn max_message_bytes(&self) -> usize {
        self.max_batch_bytes
            .max(self.max_payload_bytes)
            .saturating_mul(2)
            .max(1024 * 1024)
    }

    pub fn websocket_config(&self) -> WebSocketConfig {
        let max = self.max_message_bytes();
        WebSocketConfig::default()
            .max_message_size(Some(max))
            .max_frame_size(Some(max))
    }
}
