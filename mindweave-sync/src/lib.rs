//! # mindweave-sync: Collaborative document sync core
//!
//! Keeps every replica of a mind-map document converging on one ordered
//! history of changes, across concurrent writers and unreliable networks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐       ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │──────►│  CollabHub   │
//! │ (per user)  │     Binary Proto    │ (sessions)  │       │              │
//! └──────┬──────┘                     └─────────────┘       │ AccessControl│
//!        │                            ┌─────────────┐       │ Reconciler ──┼──► ChangeLog
//!        ▼                            │  HTTP API   │──────►│ Broadcast    │   (Memory | RocksDB)
//! ┌─────────────┐                     │ (batch sync)│       └──────────────┘
//! │PendingQueue │                     └─────────────┘
//! │(offline ok) │
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Documents, changes, collaborators, presence, share links
//! - [`storage`]: Change log store (in-memory and RocksDB)
//! - [`reconciler`]: Version check and atomic append of change batches
//! - [`access`]: Access levels and sharing
//! - [`identity`]: Credential → identity seam
//! - [`broadcast`]: Per-document fan-out with presence and backpressure
//! - [`hub`]: Join / submit / leave, shared by both server surfaces
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`server`]: WebSocket sync server with heartbeats
//! - [`http`]: Batch sync and sharing endpoints (axum)
//! - [`client`]: Reconnecting client agent with an offline queue
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Versions strictly increase by one per change | store commit lock + base check |
//! | Same order at every replica | per-document commit lock held across append and publish |
//! | Stale submissions never overwrite | `Conflict` with the changes the writer missed |
//! | Offline edits neither lost nor duplicated | pending queue acked by version and change id |

pub mod access;
pub mod broadcast;
pub mod client;
pub mod error;
pub mod http;
pub mod hub;
pub mod identity;
pub mod model;
pub mod pending;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod reconnect;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use access::AccessControl;
pub use broadcast::{Broadcast, BroadcastStats, ChannelError, ChannelEvent, LocalBroadcast, Subscription};
pub use client::{ClientConfig, SyncClient, SyncEvent};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use hub::{CollabHub, JoinOutcome};
pub use identity::{Credentials, IdentityProvider, StaticTokens, TrustedIdentity};
pub use model::{
    AccessLevel, Change, Collaborator, Document, Identity, PendingChange, PresenceEntry, ShareLink,
};
pub use pending::PendingQueue;
pub use presence::{PresenceKind, PresenceRegistry, PresenceRoster};
pub use protocol::{Limits, ProtocolError, SyncMessage};
pub use reconciler::{Reconciler, Reconciliation};
pub use reconnect::{AgentEvent, AgentState, Backoff};
pub use server::{ServerConfig, ServerStats, SessionState, SyncServer};
pub use storage::{
    AccessRecords, ChangeLog, MemoryStore, RocksStore, Store, StoreConfig, StoreError,
};
