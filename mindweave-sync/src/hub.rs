//! Server-side collaboration hub.
//!
//! Shared by the WebSocket server and the HTTP API: every submission,
//! live or batch, goes through [`CollabHub::submit`], so every member of a
//! document sees accepted changes in the same version-ascending order.
//!
//! ```text
//!            ┌──────────────── CollabHub ────────────────┐
//!  join ───► │ AccessControl ─► Broadcast::join ─► log    │ ──► JoinOutcome
//!            │                  (subscribe first)  replay │
//!  submit ─► │ commit lock(doc) ─► Reconciler ─► publish  │ ──► Reconciliation
//!            │                   (held across both)       │
//!  leave ──► │ Broadcast::leave ─► publish(Left)          │
//!            └────────────────────────────────────────────┘
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::access::AccessControl;
use crate::broadcast::{Broadcast, BroadcastStats, ChannelEvent, LocalBroadcast, Subscription};
use crate::error::{SyncError, SyncResult};
use crate::identity::{Credentials, IdentityProvider, TrustedIdentity};
use crate::model::{AccessLevel, Change, Document, Identity, PendingChange, PresenceEntry};
use crate::presence::PresenceKind;
use crate::protocol::Limits;
use crate::reconciler::{Reconciler, Reconciliation};
use crate::storage::{ChangeLog, MemoryStore, Store};

/// Everything a newly joined session needs.
pub struct JoinOutcome {
    pub session_id: Uuid,
    pub access: AccessLevel,
    pub current_version: u64,
    /// Changes in `(last_version, current_version]`.
    pub missed: Vec<Change>,
    /// Members at join time, this session included.
    pub presence: Vec<PresenceEntry>,
    pub subscription: Subscription,
}

pub struct CollabHub {
    log: Arc<dyn ChangeLog>,
    access: AccessControl,
    reconciler: Reconciler,
    channel: Arc<dyn Broadcast>,
    identity: Arc<dyn IdentityProvider>,
    limits: Limits,
    /// Per-document commit locks, held across reconcile + publish.
    commit_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl CollabHub {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        channel: Arc<dyn Broadcast>,
        identity: Arc<dyn IdentityProvider>,
        limits: Limits,
    ) -> Self {
        let log: Arc<dyn ChangeLog> = store.clone();
        Self {
            reconciler: Reconciler::new(log.clone()),
            access: AccessControl::new(store),
            log,
            channel,
            identity,
            limits,
            commit_locks: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory store, local channel, trusted identities.
    pub fn in_memory(broadcast_capacity: usize) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalBroadcast::new(broadcast_capacity)),
            Arc::new(TrustedIdentity),
            Limits::default(),
        )
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn authenticate(&self, credentials: &Credentials) -> SyncResult<Identity> {
        self.identity.authenticate(credentials)
    }

    pub fn create_document(&self, owner: &Identity, title: &str) -> SyncResult<Document> {
        self.access.create_document(owner, title)
    }

    pub fn document(&self, identity: &Identity, doc_id: Uuid) -> SyncResult<Document> {
        self.access.require(doc_id, identity.id, AccessLevel::View)?;
        Ok(self.log.document(doc_id)?)
    }

    pub fn list_documents(&self) -> SyncResult<Vec<Uuid>> {
        Ok(self.log.list_documents()?)
    }

    /// Join a document channel and replay what the caller missed.
    pub fn join(
        &self,
        doc_id: Uuid,
        identity: &Identity,
        session_id: Uuid,
        last_version: u64,
    ) -> SyncResult<JoinOutcome> {
        let access = self.access.can_join(doc_id, identity)?;
        let entry = PresenceEntry::new(session_id, identity.clone(), access);

        // Subscribe before reading the log: anything committed from here on
        // is either in `missed` or delivered through the subscription.
        let subscription = self.channel.join(doc_id, entry.clone());

        let replay = self.replay(doc_id, last_version);
        let (current_version, missed) = match replay {
            Ok(replay) => replay,
            Err(e) => {
                self.channel.leave(doc_id, session_id);
                return Err(e);
            }
        };

        let presence = self.channel.presence(doc_id);
        self.channel.publish(
            doc_id,
            ChannelEvent::Presence {
                kind: PresenceKind::Joined,
                entry,
            },
        );

        log::info!(
            "{} joined {doc_id} as {access} (session {session_id}, v{last_version} -> v{current_version}, {} missed)",
            identity.display_name,
            missed.len()
        );

        Ok(JoinOutcome {
            session_id,
            access,
            current_version,
            missed,
            presence,
            subscription,
        })
    }

    fn replay(&self, doc_id: Uuid, since: u64) -> SyncResult<(u64, Vec<Change>)> {
        let current = self.log.current_version(doc_id)?;
        if since > current {
            log::error!("Document {doc_id}: client claims v{since}, log is at v{current}");
            return Err(SyncError::Corrupt(format!(
                "client version {since} is ahead of current version {current}"
            )));
        }
        let changes = self.log.read_since(doc_id, since)?;
        // The log may have moved on between the two reads.
        let current = changes.last().map_or(current, |c| c.version.max(current));
        Ok((current, changes))
    }

    /// Reconcile a batch and broadcast what was accepted.
    ///
    /// `origin` is the submitting live session, `None` for HTTP batches.
    pub async fn submit(
        &self,
        doc_id: Uuid,
        identity: &Identity,
        origin: Option<Uuid>,
        base_version: u64,
        pending: Vec<PendingChange>,
    ) -> SyncResult<Reconciliation> {
        self.limits.check_batch(&pending)?;
        self.access.require(doc_id, identity.id, AccessLevel::Edit)?;

        let lock = self.commit_lock(doc_id);
        let result = {
            let _guard = lock.lock().await;
            self.reconciler
                .reconcile(doc_id, identity.id, base_version, pending)
                .map(|outcome| {
                    if let Reconciliation::Accepted { changes, .. } = &outcome {
                        for change in changes {
                            self.channel.publish(
                                doc_id,
                                ChannelEvent::Change {
                                    origin,
                                    change: change.clone(),
                                },
                            );
                        }
                    }
                    outcome
                })
        };
        drop(lock);
        self.release_commit_lock(doc_id);
        result
    }

    fn commit_lock(&self, doc_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.commit_locks
            .lock()
            .entry(doc_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the document's lock once no submitter holds or awaits it.
    fn release_commit_lock(&self, doc_id: Uuid) {
        let mut locks = self.commit_locks.lock();
        if locks.get(&doc_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&doc_id);
        }
    }

    /// Leave the channel; remaining members are told.
    pub fn leave(&self, doc_id: Uuid, session_id: Uuid) -> Option<PresenceEntry> {
        let entry = self.channel.leave(doc_id, session_id)?;
        self.channel.publish(
            doc_id,
            ChannelEvent::Presence {
                kind: PresenceKind::Left,
                entry: entry.clone(),
            },
        );
        log::info!(
            "{} left {doc_id} (session {session_id})",
            entry.identity.display_name
        );
        Some(entry)
    }

    /// Changes after `since`, plus the version they lead to.
    pub fn read_since(&self, doc_id: Uuid, identity: &Identity, since: u64) -> SyncResult<(u64, Vec<Change>)> {
        self.access.require(doc_id, identity.id, AccessLevel::View)?;
        self.replay(doc_id, since)
    }

    pub fn touch(&self, doc_id: Uuid, session_id: Uuid) -> bool {
        self.channel.touch(doc_id, session_id)
    }

    pub fn presence(&self, doc_id: Uuid) -> Vec<PresenceEntry> {
        self.channel.presence(doc_id)
    }

    pub fn channel_stats(&self, doc_id: Uuid) -> Option<BroadcastStats> {
        self.channel.stats(doc_id)
    }
}
