//! Per-document fan-out channel with presence.
//!
//! The [`Broadcast`] trait is the seam: `join` / `publish` / `leave` over any
//! message-passing substrate. [`LocalBroadcast`] is the in-process
//! implementation, one tokio broadcast channel per document.
//!
//! ```text
//!                    ┌──────────── Room(doc) ────────────┐
//!  publish(event) ──►│ broadcast::Sender<Arc<ChannelEvent>>│──► Subscription (session A)
//!                    │  capacity = per-member buffer      │──► Subscription (session B)
//!                    └────────────────────────────────────┘──► Subscription (session C)
//! ```
//!
//! Backpressure: a member that falls more than `capacity` events behind
//! loses the oldest ones and sees [`ChannelError::Lagged`] on its next
//! receive. Publishers never wait on slow members. Recovering what was lost
//! is the receiver's job (the server session re-reads the change log).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{Change, PresenceEntry};
use crate::presence::{PresenceKind, PresenceRegistry};

/// Event fanned out to every member of a document channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// An accepted change. `origin` is the submitting session, if live.
    Change { origin: Option<Uuid>, change: Change },
    Presence { kind: PresenceKind, entry: PresenceEntry },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// This many events were dropped from the member's buffer.
    Lagged(u64),
    Closed,
}

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_members: usize,
    pub capacity: usize,
}

/// A member's receiving end of a document channel.
pub struct Subscription {
    pub doc_id: Uuid,
    pub session_id: Uuid,
    rx: broadcast::Receiver<Arc<ChannelEvent>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<Arc<ChannelEvent>, ChannelError> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(n) => ChannelError::Lagged(n),
            broadcast::error::RecvError::Closed => ChannelError::Closed,
        })
    }

    /// Non-blocking receive; `Ok(None)` when nothing is buffered.
    pub fn try_recv(&mut self) -> Result<Option<Arc<ChannelEvent>>, ChannelError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(ChannelError::Lagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Err(ChannelError::Closed),
        }
    }
}

/// Substrate-neutral per-document broadcast channel.
pub trait Broadcast: Send + Sync {
    /// Register a member and start receiving. Events published before this
    /// call are not delivered.
    fn join(&self, doc_id: Uuid, entry: PresenceEntry) -> Subscription;

    /// Deliver to every current member, the publisher included. Returns the
    /// number of members reached.
    fn publish(&self, doc_id: Uuid, event: ChannelEvent) -> usize;

    fn leave(&self, doc_id: Uuid, session_id: Uuid) -> Option<PresenceEntry>;

    fn presence(&self, doc_id: Uuid) -> Vec<PresenceEntry>;

    fn stats(&self, doc_id: Uuid) -> Option<BroadcastStats>;

    /// Refresh a member's `last_active`. False for unknown members.
    fn touch(&self, doc_id: Uuid, session_id: Uuid) -> bool;
}

struct Room {
    sender: broadcast::Sender<Arc<ChannelEvent>>,
    messages_sent: AtomicU64,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            messages_sent: AtomicU64::new(0),
        }
    }
}

/// In-process broadcast: rooms are created on first join and dropped when
/// the last member leaves.
pub struct LocalBroadcast {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    presence: PresenceRegistry,
    capacity: usize,
}

impl LocalBroadcast {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            presence: PresenceRegistry::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().keys().copied().collect()
    }
}

impl Broadcast for LocalBroadcast {
    fn join(&self, doc_id: Uuid, entry: PresenceEntry) -> Subscription {
        let session_id = entry.session_id;
        // Room creation, membership and subscription under one write lock so
        // a concurrent last-leave cannot drop the room in between.
        let mut rooms = self.rooms.write();
        let room = rooms
            .entry(doc_id)
            .or_insert_with(|| Arc::new(Room::new(self.capacity)))
            .clone();
        self.presence.insert(doc_id, entry);
        let rx = room.sender.subscribe();
        drop(rooms);

        log::debug!("Session {session_id} joined channel {doc_id}");
        Subscription {
            doc_id,
            session_id,
            rx,
        }
    }

    fn publish(&self, doc_id: Uuid, event: ChannelEvent) -> usize {
        let Some(room) = self.rooms.read().get(&doc_id).cloned() else {
            return 0;
        };
        room.messages_sent.fetch_add(1, Ordering::Relaxed);
        room.sender.send(Arc::new(event)).unwrap_or(0)
    }

    fn leave(&self, doc_id: Uuid, session_id: Uuid) -> Option<PresenceEntry> {
        let mut rooms = self.rooms.write();
        let removed = self.presence.remove(doc_id, session_id);
        if self.presence.count(doc_id) == 0 && rooms.remove(&doc_id).is_some() {
            log::debug!("Channel {doc_id} closed (last member left)");
        }
        removed
    }

    fn presence(&self, doc_id: Uuid) -> Vec<PresenceEntry> {
        self.presence.list(doc_id)
    }

    fn stats(&self, doc_id: Uuid) -> Option<BroadcastStats> {
        let room = self.rooms.read().get(&doc_id).cloned()?;
        Some(BroadcastStats {
            messages_sent: room.messages_sent.load(Ordering::Relaxed),
            active_members: self.presence.count(doc_id),
            capacity: self.capacity,
        })
    }

    fn touch(&self, doc_id: Uuid, session_id: Uuid) -> bool {
        self.presence.touch(doc_id, session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessLevel, Identity};

    fn entry(name: &str) -> PresenceEntry {
        PresenceEntry::new(Uuid::new_v4(), Identity::random(name), AccessLevel::Edit)
    }

    fn change_event(doc_id: Uuid, version: u64) -> ChannelEvent {
        ChannelEvent::Change {
            origin: None,
            change: Change {
                id: Uuid::new_v4(),
                doc_id,
                author: Uuid::new_v4(),
                timestamp: 0,
                version,
                payload: vec![version as u8],
            },
        }
    }

    fn version_of(event: &ChannelEvent) -> u64 {
        match event {
            ChannelEvent::Change { change, .. } => change.version,
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_all_members() {
        let channel = LocalBroadcast::new(16);
        let doc = Uuid::new_v4();
        let mut a = channel.join(doc, entry("Alice"));
        let mut b = channel.join(doc, entry("Bob"));
        let mut c = channel.join(doc, entry("Charlie"));

        assert_eq!(channel.publish(doc, change_event(doc, 1)), 3);

        // Publisher filtering is the caller's job.
        for sub in [&mut a, &mut b, &mut c] {
            assert_eq!(version_of(&sub.recv().await.unwrap()), 1);
        }
    }

    #[tokio::test]
    async fn test_documents_are_isolated() {
        let channel = LocalBroadcast::new(16);
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();
        let mut sub1 = channel.join(doc1, entry("A"));
        let mut sub2 = channel.join(doc2, entry("B"));

        channel.publish(doc1, change_event(doc1, 1));
        assert!(sub1.try_recv().unwrap().is_some());
        assert!(sub2.try_recv().unwrap().is_none());
        assert_eq!(channel.room_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_members() {
        let channel = LocalBroadcast::new(16);
        assert_eq!(channel.publish(Uuid::new_v4(), change_event(Uuid::new_v4(), 1)), 0);
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let channel = LocalBroadcast::new(64);
        let doc = Uuid::new_v4();
        let mut sub = channel.join(doc, entry("A"));
        for v in 1..=20 {
            channel.publish(doc, change_event(doc, v));
        }
        for v in 1..=20 {
            assert_eq!(version_of(&sub.recv().await.unwrap()), v);
        }
    }

    #[tokio::test]
    async fn test_slow_member_lags_fast_member_unaffected() {
        let channel = LocalBroadcast::new(4);
        let doc = Uuid::new_v4();
        let mut slow = channel.join(doc, entry("Slow"));
        let mut fast = channel.join(doc, entry("Fast"));

        for v in 1..=10 {
            channel.publish(doc, change_event(doc, v));
            assert_eq!(version_of(&fast.recv().await.unwrap()), v);
        }

        assert_eq!(slow.recv().await.unwrap_err(), ChannelError::Lagged(6));
        // Oldest dropped, newest kept.
        assert_eq!(version_of(&slow.recv().await.unwrap()), 7);
    }

    #[tokio::test]
    async fn test_leave_and_room_cleanup() {
        let channel = LocalBroadcast::new(16);
        let doc = Uuid::new_v4();
        let alice = entry("Alice");
        let bob = entry("Bob");
        let _a = channel.join(doc, alice.clone());
        let _b = channel.join(doc, bob.clone());
        assert_eq!(channel.presence(doc).len(), 2);

        assert_eq!(channel.leave(doc, alice.session_id), Some(alice.clone()));
        assert_eq!(channel.room_count(), 1);
        assert_eq!(channel.presence(doc), vec![bob.clone()]);

        channel.leave(doc, bob.session_id);
        assert_eq!(channel.room_count(), 0);
        assert!(channel.stats(doc).is_none());
        assert_eq!(channel.leave(doc, bob.session_id), None);
    }

    #[tokio::test]
    async fn test_stats() {
        let channel = LocalBroadcast::new(32);
        let doc = Uuid::new_v4();
        let _sub = channel.join(doc, entry("A"));
        channel.publish(doc, change_event(doc, 1));
        channel.publish(doc, change_event(doc, 2));

        let stats = channel.stats(doc).unwrap();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_members, 1);
        assert_eq!(stats.capacity, 32);
    }

    #[tokio::test]
    async fn test_late_joiner_misses_earlier_events() {
        let channel = LocalBroadcast::new(16);
        let doc = Uuid::new_v4();
        let _first = channel.join(doc, entry("First"));
        channel.publish(doc, change_event(doc, 1));

        let mut late = channel.join(doc, entry("Late"));
        assert!(late.try_recv().unwrap().is_none());
    }
}
