//! Error taxonomy of the sync core.
//!
//! | Kind                | Who handles it                                   |
//! |---------------------|--------------------------------------------------|
//! | `NotFound`          | caller, no retry                                 |
//! | `AccessDenied`      | caller, no retry                                 |
//! | `Conflict`          | client agent (rebase + resubmit), never the user |
//! | `Corrupt`           | logged, hard failure for the operation           |
//! | `TransportFailure`  | client agent reconnect state machine             |
//! | `ValidationFailure` | caller, rejected before touching storage         |

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Serializable error kind, carried on the wire and in HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    Conflict,
    Corrupt,
    TransportFailure,
    ValidationFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::TransportFailure => "transport_failure",
            ErrorKind::ValidationFailure => "validation_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Version conflict (current version {current_version})")]
    Conflict { current_version: u64 },

    #[error("Invariant violation: {0}")]
    Corrupt(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Invalid request: {0}")]
    ValidationFailure(String),
}

impl SyncError {
    pub fn document_not_found(id: Uuid) -> Self {
        SyncError::NotFound(format!("document {id}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::AccessDenied(_) => ErrorKind::AccessDenied,
            SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::Corrupt(_) => ErrorKind::Corrupt,
            SyncError::TransportFailure(_) => ErrorKind::TransportFailure,
            SyncError::ValidationFailure(_) => ErrorKind::ValidationFailure,
        }
    }

    /// Authoritative version, where the error carries one.
    pub fn current_version(&self) -> Option<u64> {
        match self {
            SyncError::Conflict { current_version } => Some(*current_version),
            _ => None,
        }
    }

    /// Whether the client agent retries this automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Conflict { .. } | SyncError::TransportFailure(_))
    }

    /// Rebuild an error received over the wire.
    pub fn from_wire(kind: ErrorKind, message: String, current_version: Option<u64>) -> Self {
        match kind {
            ErrorKind::NotFound => SyncError::NotFound(message),
            ErrorKind::AccessDenied => SyncError::AccessDenied(message),
            ErrorKind::Conflict => SyncError::Conflict {
                current_version: current_version.unwrap_or_default(),
            },
            ErrorKind::Corrupt => SyncError::Corrupt(message),
            ErrorKind::TransportFailure => SyncError::TransportFailure(message),
            ErrorKind::ValidationFailure => SyncError::ValidationFailure(message),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SyncError::document_not_found(id),
            StoreError::Conflict { current } => SyncError::Conflict {
                current_version: current,
            },
            StoreError::Corrupt(msg) => SyncError::Corrupt(msg),
            StoreError::AlreadyExists(id) => {
                SyncError::ValidationFailure(format!("Document {id} already exists"))
            }
            // Backend failures are hard failures for the operation.
            other => SyncError::Corrupt(other.to_string()),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::TransportFailure(e.to_string())
    }
}
