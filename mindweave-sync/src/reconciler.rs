//! Version reconciliation.
//!
//! ```text
//!  submit(base, [p1..pN])
//!        │
//!        ▼
//!  current = store.current_version(doc)
//!        │
//!   ┌────┴───────────────┬──────────────────────┐
//!   │ base == current    │ base < current       │ base > current
//!   ▼                    ▼                      ▼
//!  append_batch       read_since(base)        Corrupt
//!  v = base+1..base+N  → Conflict(current,     (client claims a
//!   → Accepted(base+N)    server_changes)      version that never existed)
//! ```
//!
//! The reconciler never rewrites history and never retries on the client's
//! behalf: a rejected client rebases and resubmits.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::model::{now_millis, Change, PendingChange};
use crate::storage::{ChangeLog, StoreError};

/// Outcome of one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Batch stored. `changes` are the stored records, ready to broadcast.
    Accepted { new_version: u64, changes: Vec<Change> },
    /// Client was behind. Nothing was applied.
    Conflict {
        current_version: u64,
        server_changes: Vec<Change>,
    },
}

impl Reconciliation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Reconciliation::Accepted { .. })
    }
}

pub struct Reconciler {
    log: Arc<dyn ChangeLog>,
}

impl Reconciler {
    pub fn new(log: Arc<dyn ChangeLog>) -> Self {
        Self { log }
    }

    /// Decide a batch of pending changes submitted against `base_version`.
    pub fn reconcile(
        &self,
        doc_id: Uuid,
        author: Uuid,
        base_version: u64,
        pending: Vec<PendingChange>,
    ) -> SyncResult<Reconciliation> {
        if pending.is_empty() {
            return Err(SyncError::ValidationFailure("empty change batch".into()));
        }

        let current = self.log.current_version(doc_id)?;
        if base_version > current {
            log::error!(
                "Document {doc_id}: submission at base {base_version} is ahead of current {current}"
            );
            return Err(SyncError::Corrupt(format!(
                "base version {base_version} is ahead of current version {current}"
            )));
        }
        if base_version < current {
            return self.conflict(doc_id, base_version);
        }

        let timestamp = now_millis();
        let changes: Vec<Change> = pending
            .into_iter()
            .enumerate()
            .map(|(i, p)| p.into_change(doc_id, author, base_version + 1 + i as u64, timestamp))
            .collect();

        match self.log.append_batch(doc_id, changes.clone()) {
            Ok(new_version) => {
                log::debug!(
                    "Document {doc_id}: accepted {} change(s), v{base_version} -> v{new_version}",
                    changes.len()
                );
                Ok(Reconciliation::Accepted {
                    new_version,
                    changes,
                })
            }
            // Another writer got in between the version read and the write.
            Err(StoreError::Conflict { .. }) => self.conflict(doc_id, base_version),
            Err(e) => {
                log::error!("Document {doc_id}: append failed: {e}");
                Err(e.into())
            }
        }
    }

    fn conflict(&self, doc_id: Uuid, base_version: u64) -> SyncResult<Reconciliation> {
        let server_changes = self.log.read_since(doc_id, base_version)?;
        let current_version = server_changes
            .last()
            .map_or(base_version, |c| c.version);
        log::debug!(
            "Document {doc_id}: rejected submission at v{base_version}, current v{current_version}"
        );
        Ok(Reconciliation::Conflict {
            current_version,
            server_changes,
        })
    }
}
