//! Presence: who is connected to a document right now.
//!
//! ```text
//! server session joins ──► PresenceRegistry::insert ──► ChannelEvent::Presence(Joined)
//!        │                                                     │
//!   heartbeat pong ──► touch(last_active)                      ▼ (broadcast)
//!        │                                           client PresenceRoster::apply
//! session closes ──► PresenceRegistry::remove ──► ChannelEvent::Presence(Left)
//! ```
//!
//! Entries are ephemeral and keyed by session, not by user: one user with
//! two tabs open is two entries. Durable access levels are kept apart in
//! [`crate::access`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::{now_millis, PresenceEntry};

/// Presence change carried on the channel and the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceKind {
    Joined,
    Left,
}

/// Server-side registry: doc_id → session_id → entry.
#[derive(Default)]
pub struct PresenceRegistry {
    rooms: RwLock<HashMap<Uuid, HashMap<Uuid, PresenceEntry>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc_id: Uuid, entry: PresenceEntry) {
        self.rooms
            .write()
            .entry(doc_id)
            .or_default()
            .insert(entry.session_id, entry);
    }

    /// Remove a session; drops the document's room once empty.
    pub fn remove(&self, doc_id: Uuid, session_id: Uuid) -> Option<PresenceEntry> {
        let mut rooms = self.rooms.write();
        let room = rooms.get_mut(&doc_id)?;
        let removed = room.remove(&session_id);
        if room.is_empty() {
            rooms.remove(&doc_id);
        }
        removed
    }

    /// Refresh `last_active`. Returns false for unknown sessions.
    pub fn touch(&self, doc_id: Uuid, session_id: Uuid) -> bool {
        let mut rooms = self.rooms.write();
        match rooms.get_mut(&doc_id).and_then(|room| room.get_mut(&session_id)) {
            Some(entry) => {
                entry.last_active = now_millis();
                true
            }
            None => false,
        }
    }

    /// Entries for one document, oldest join first.
    pub fn list(&self, doc_id: Uuid) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .rooms
            .read()
            .get(&doc_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by_key(|e| (e.joined_at, e.session_id));
        entries
    }

    pub fn count(&self, doc_id: Uuid) -> usize {
        self.rooms.read().get(&doc_id).map_or(0, HashMap::len)
    }

    pub fn contains(&self, doc_id: Uuid, session_id: Uuid) -> bool {
        self.rooms
            .read()
            .get(&doc_id)
            .is_some_and(|room| room.contains_key(&session_id))
    }

    pub fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().keys().copied().collect()
    }
}

/// Client-side view of the other sessions on the agent's document.
#[derive(Debug, Clone)]
pub struct PresenceRoster {
    local_session: Option<Uuid>,
    peers: HashMap<Uuid, PresenceEntry>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self {
            local_session: None,
            peers: HashMap::new(),
        }
    }

    /// Replace the roster with a `Joined` snapshot.
    pub fn reset(&mut self, local_session: Uuid, entries: Vec<PresenceEntry>) {
        self.local_session = Some(local_session);
        self.peers = entries
            .into_iter()
            .filter(|e| e.session_id != local_session)
            .map(|e| (e.session_id, e))
            .collect();
    }

    /// Apply an update. Returns false when it changed nothing (own session,
    /// duplicate join, unknown leave).
    pub fn apply(&mut self, kind: PresenceKind, entry: PresenceEntry) -> bool {
        if Some(entry.session_id) == self.local_session {
            return false;
        }
        match kind {
            PresenceKind::Joined => self.peers.insert(entry.session_id, entry).is_none(),
            PresenceKind::Left => self.peers.remove(&entry.session_id).is_some(),
        }
    }

    pub fn clear(&mut self) {
        self.local_session = None;
        self.peers.clear();
    }

    pub fn peers(&self) -> Vec<PresenceEntry> {
        let mut peers: Vec<PresenceEntry> = self.peers.values().cloned().collect();
        peers.sort_by_key(|e| (e.joined_at, e.session_id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for PresenceRoster {
    fn default() -> Self {
        Self::new()
    }
}
