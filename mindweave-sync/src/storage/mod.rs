//! Change log persistence.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  reconcile   ┌────────────┐   append_batch   ┌──────────────┐
//! │ CollabHub   │ ───────────► │ Reconciler │ ───────────────► │ ChangeLog    │
//! │             │              └────────────┘   read_since     │ (trait)      │
//! │             │ ─── access ─────────────────────────────────►│ AccessRecords│
//! └─────────────┘                                              └──────┬───────┘
//!                                                    ┌────────────────┴──────┐
//!                                                    ▼                       ▼
//!                                              MemoryStore             RocksStore
//!                                              (tests, no path)        (column families)
//! ```
//!
//! The store owns the authoritative version counter of every document. The
//! only write path is `append` / `append_batch`, which check the expected
//! version and extend the log in one atomic step.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Change, Collaborator, Document, ShareLink};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(Uuid),

    #[error("Document already exists: {0}")]
    AlreadyExists(Uuid),

    /// Expected version did not match `current + 1`.
    #[error("Version conflict: current version is {current}")]
    Conflict { current: u64 },

    /// Stored log violates an invariant (gap, duplicate, foreign change).
    #[error("Corrupt change log: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

/// Append-only, per-document, versioned change log.
pub trait ChangeLog: Send + Sync {
    /// Register a new document at version 0.
    fn create_document(&self, doc: Document) -> Result<Document, StoreError>;

    /// Point lookup.
    fn document(&self, doc_id: Uuid) -> Result<Document, StoreError>;

    /// Append one change; `change.version` must be `current_version + 1`.
    fn append(&self, doc_id: Uuid, change: Change) -> Result<Change, StoreError> {
        let version = self.append_batch(doc_id, vec![change.clone()])?;
        debug_assert_eq!(version, change.version);
        Ok(change)
    }

    /// Append consecutive changes all-or-nothing. Returns the new version.
    fn append_batch(&self, doc_id: Uuid, changes: Vec<Change>) -> Result<u64, StoreError>;

    /// All changes with `version > since`, ascending.
    fn read_since(&self, doc_id: Uuid, since: u64) -> Result<Vec<Change>, StoreError>;

    fn current_version(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.document(doc_id)?.version)
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Durable access-level records and share links.
pub trait AccessRecords: Send + Sync {
    fn collaborators(&self, doc_id: Uuid) -> Result<Vec<Collaborator>, StoreError>;

    fn collaborator(&self, doc_id: Uuid, user_id: Uuid) -> Result<Option<Collaborator>, StoreError>;

    /// Insert or replace; also keeps `Document::collaborators` in step.
    fn put_collaborator(&self, record: Collaborator) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    fn remove_collaborator(&self, doc_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;

    fn put_share_link(&self, link: ShareLink) -> Result<(), StoreError>;

    fn share_link(&self, link_id: Uuid) -> Result<Option<ShareLink>, StoreError>;

    fn share_links(&self, doc_id: Uuid) -> Result<Vec<ShareLink>, StoreError>;
}

/// A backend providing both halves of the persistence collaborator.
pub trait Store: ChangeLog + AccessRecords {}

impl<T: ChangeLog + AccessRecords> Store for T {}

/// Check that `changes` extend a log currently at `current` by consecutive
/// versions and all belong to `doc_id`.
pub(crate) fn check_batch(doc_id: Uuid, current: u64, changes: &[Change]) -> Result<(), StoreError> {
    let Some(first) = changes.first() else {
        return Ok(());
    };
    if first.version != current + 1 {
        return Err(StoreError::Conflict { current });
    }
    for (offset, change) in changes.iter().enumerate() {
        if change.doc_id != doc_id {
            return Err(StoreError::Corrupt(format!(
                "change {} belongs to document {}, not {doc_id}",
                change.id, change.doc_id
            )));
        }
        let expected = current + 1 + offset as u64;
        if change.version != expected {
            return Err(StoreError::Corrupt(format!(
                "batch is not consecutive: expected version {expected}, got {}",
                change.version
            )));
        }
    }
    Ok(())
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(value)
}
