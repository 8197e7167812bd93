//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── AccessControl
//!            ├── session task ── CollabHub ── Reconciler ── ChangeLog (Memory | RocksDB)
//! Client B ──┘        ▲                └── LocalBroadcast (one channel per document)
//!                     │                          │
//!                     └──── Subscription ◄───────┘
//! ```
//!
//! One task per connection. The first frame must be `Join`; after that the
//! task multiplexes client frames, channel events and the heartbeat timer.
//!
//! Session lifecycle:
//! ```text
//! Connecting ──Join ok──► Joined ──frame──► Active ◄──frame── Degraded
//!      │                    │                 │ missed ping ──►  │
//!      └──── error ─────────┴─────────────────┴──► Closed ◄──────┘ (max misses)
//! ```
//!
//! A session whose channel buffer overflowed re-reads the changes it lost
//! from the change log, starting at the last version it delivered. If that
//! read fails the session is closed.
//!
//! Replays in `Joined`, `CaughtUp` and `ChangeRejected` carry at most one
//! page of changes (see [`Limits::page`]); the client pages through the rest
//! with `CatchUp`.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 5 & 8

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{ChannelError, ChannelEvent, LocalBroadcast};
use crate::error::{SyncError, SyncResult};
use crate::hub::CollabHub;
use crate::identity::{IdentityProvider, TrustedIdentity};
use crate::model::{Change, Identity};
use crate::protocol::{Limits, ProtocolError, SyncMessage};
use crate::reconciler::Reconciliation;
use crate::storage::{MemoryStore, RocksStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket address to bind to
    pub bind_addr: String,
    /// Per-member channel buffer, in events
    pub broadcast_capacity: usize,
    /// Interval between server pings
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered pings before the session is closed
    pub max_missed_heartbeats: u32,
    pub max_batch_len: usize,
    pub max_payload_bytes: usize,
    /// Payload bytes per frame; longer replays are split
    pub max_batch_bytes: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// HTTP API address (None = no HTTP API)
    pub http_addr: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 3,
            max_batch_len: limits.max_batch_len,
            max_payload_bytes: limits.max_payload_bytes,
            max_batch_bytes: limits.max_batch_bytes,
            storage_path: None,
            http_addr: None,
        }
    }
}

impl ServerConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_batch_len: self.max_batch_len,
            max_payload_bytes: self.max_payload_bytes,
            max_batch_bytes: self.max_batch_bytes,
        }
    }

    /// How long a connection may take to send its `Join`.
    fn join_timeout(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.max_missed_heartbeats.max(1))
    }
}

/// Per-connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Active,
    Degraded { missed: u32 },
    Closed,
}

impl SessionState {
    pub fn on_joined(self) -> Self {
        match self {
            SessionState::Connecting => SessionState::Joined,
            other => other,
        }
    }

    /// Any frame from the client proves it is alive.
    pub fn on_activity(self) -> Self {
        match self {
            SessionState::Joined | SessionState::Degraded { .. } => SessionState::Active,
            other => other,
        }
    }

    /// A heartbeat went unanswered.
    pub fn on_missed_heartbeat(self, max_missed: u32) -> Self {
        let missed = match self {
            SessionState::Joined | SessionState::Active => 1,
            SessionState::Degraded { missed } => missed + 1,
            other => return other,
        };
        if missed >= max_missed {
            SessionState::Closed
        } else {
            SessionState::Degraded { missed }
        }
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Channel events dropped from slow members' buffers (and then re-read)
    pub lagged_events: u64,
    pub accepted_changes: u64,
    pub rejected_submissions: u64,
}

#[derive(Default)]
struct ServerCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    lagged_events: AtomicU64,
    accepted_changes: AtomicU64,
    rejected_submissions: AtomicU64,
}

impl ServerCounters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            lagged_events: self.lagged_events.load(Ordering::Relaxed),
            accepted_changes: self.accepted_changes.load(Ordering::Relaxed),
            rejected_submissions: self.rejected_submissions.load(Ordering::Relaxed),
        }
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The live collaboration server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<CollabHub>,
    counters: Arc<ServerCounters>,
}

impl SyncServer {
    /// Create a server with trusted identities. Opens RocksDB when
    /// `storage_path` is set.
    pub fn new(config: ServerConfig) -> SyncResult<Self> {
        Self::with_identity(config, Arc::new(TrustedIdentity))
    }

    pub fn with_identity(config: ServerConfig, identity: Arc<dyn IdentityProvider>) -> SyncResult<Self> {
        let channel = Arc::new(LocalBroadcast::new(config.broadcast_capacity));
        let hub = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                CollabHub::new(Arc::new(store), channel, identity, config.limits())
            }
            None => CollabHub::new(Arc::new(MemoryStore::new()), channel, identity, config.limits()),
        };
        Ok(Self::with_hub(config, Arc::new(hub)))
    }

    /// Serve an existing hub (shared with the HTTP API or a test).
    pub fn with_hub(config: ServerConfig, hub: Arc<CollabHub>) -> Self {
        Self {
            config,
            hub,
            counters: Arc::new(ServerCounters::default()),
        }
    }

    pub fn hub(&self) -> &Arc<CollabHub> {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    /// Report what is already persisted.
    pub fn recover(&self) -> SyncResult<usize> {
        let docs = self.hub.list_documents()?;
        if !docs.is_empty() {
            log::info!("Change log holds {} document(s)", docs.len());
        }
        Ok(docs.len())
    }

    /// Bind the configured address. Port 0 picks a free port; read it back
    /// from the listener.
    pub async fn bind(&self) -> SyncResult<TcpListener> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| SyncError::TransportFailure(format!("bind {}: {e}", self.config.bind_addr)))
    }

    /// Bind and serve until the accept loop fails.
    pub async fn run(&self) -> SyncResult<()> {
        self.recover()?;
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> SyncResult<()> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Sync server listening on {addr}");
        }

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| SyncError::TransportFailure(e.to_string()))?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let config = self.config.clone();
            let counters = self.counters.clone();
            tokio::spawn(async move {
                counters.total_connections.fetch_add(1, Ordering::Relaxed);
                counters.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(stream, addr, hub, &config, &counters).await {
                    log::warn!("Connection from {addr} ended with error: {e}");
                }
                counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn send(ws_sender: &mut WsSink, msg: &SyncMessage) -> SyncResult<()> {
    let encoded = msg.encode()?;
    ws_sender
        .send(Message::Binary(encoded.into()))
        .await
        .map_err(ProtocolError::from)?;
    Ok(())
}

/// Reject a connection with an error frame, then close it.
async fn refuse(ws_sender: &mut WsSink, err: &SyncError) {
    let _ = send(ws_sender, &SyncMessage::error(err)).await;
    let _ = ws_sender.send(Message::Close(None)).await;
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<CollabHub>,
    config: &ServerConfig,
    counters: &ServerCounters,
) -> SyncResult<()> {
    let ws_config = config.limits().websocket_config();
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
        .await
        .map_err(ProtocolError::from)?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::debug!("WebSocket connection established from {addr}");

    // ─── Connecting: wait for Join ─────────────────────────────────
    let first = match tokio::time::timeout(config.join_timeout(), ws_receiver.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => SyncMessage::decode(&data),
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
        Ok(Some(Ok(other))) => Err(ProtocolError::Unexpected(format!("{other:?}"))),
        Ok(Some(Err(e))) => return Err(ProtocolError::from(e).into()),
        Err(_) => {
            log::warn!("Connection from {addr} sent no Join in time");
            refuse(&mut ws_sender, &SyncError::TransportFailure("join timeout".into())).await;
            return Ok(());
        }
    };

    let (doc_id, credentials, last_version) = match first {
        Ok(SyncMessage::Join {
            doc_id,
            credentials,
            last_version,
        }) => (doc_id, credentials, last_version),
        Ok(other) => {
            log::warn!("Connection from {addr} opened with {} instead of Join", other.name());
            let err = SyncError::ValidationFailure(format!("expected Join, got {}", other.name()));
            refuse(&mut ws_sender, &err).await;
            return Ok(());
        }
        Err(e) => {
            log::warn!("Undecodable first frame from {addr}: {e}");
            refuse(&mut ws_sender, &SyncError::ValidationFailure(e.to_string())).await;
            return Ok(());
        }
    };

    let identity = match hub.authenticate(&credentials) {
        Ok(identity) => identity,
        Err(e) => {
            refuse(&mut ws_sender, &e).await;
            return Ok(());
        }
    };

    let session_id = Uuid::new_v4();
    let joined = match hub.join(doc_id, &identity, session_id, last_version) {
        Ok(joined) => joined,
        Err(e) => {
            log::warn!("Join of {doc_id} by {} refused: {e}", identity.id);
            refuse(&mut ws_sender, &e).await;
            return Ok(());
        }
    };

    let mut session = Session {
        doc_id,
        session_id,
        identity,
        delivered: joined.current_version,
        state: SessionState::Connecting.on_joined(),
        hub: hub.clone(),
        limits: config.limits(),
    };
    let mut subscription = joined.subscription;

    // A long replay is paged; the client asks for the rest with CatchUp.
    let reply = SyncMessage::Joined {
        session_id,
        access: joined.access,
        current_version: joined.current_version,
        missed: session.limits.page(joined.missed),
        presence: joined.presence,
    };
    let result = match send(&mut ws_sender, &reply).await {
        Ok(()) => {
            session
                .run(&mut ws_sender, &mut ws_receiver, &mut subscription, config, counters)
                .await
        }
        Err(e) => Err(e),
    };

    // ─── Closed ────────────────────────────────────────────────────
    session.state = SessionState::Closed;
    hub.leave(doc_id, session_id);
    let _ = ws_sender.send(Message::Close(None)).await;
    result
}

struct Session {
    doc_id: Uuid,
    session_id: Uuid,
    identity: Identity,
    /// Highest version forwarded to the client.
    delivered: u64,
    state: SessionState,
    hub: Arc<CollabHub>,
    limits: Limits,
}

impl Session {
    async fn run(
        &mut self,
        ws_sender: &mut WsSink,
        ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
        subscription: &mut crate::broadcast::Subscription,
        config: &ServerConfig,
        counters: &ServerCounters,
    ) -> SyncResult<()> {
        let start = tokio::time::Instant::now() + config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(start, config.heartbeat_interval);
        let mut nonce: u64 = 0;
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            counters.total_messages.fetch_add(1, Ordering::Relaxed);
                            counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                            self.state = self.state.on_activity();
                            awaiting_pong = false;

                            match SyncMessage::decode(&data) {
                                Ok(msg) => self.handle_frame(msg, ws_sender, counters).await?,
                                Err(e) => {
                                    log::warn!("Undecodable frame in session {}: {e}", self.session_id);
                                    let err = SyncError::ValidationFailure(e.to_string());
                                    send(ws_sender, &SyncMessage::error(&err)).await?;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Session {} closed by client", self.session_id);
                            return Ok(());
                        }
                        Some(Ok(_)) => {
                            // Control frames are answered by tungstenite.
                            self.state = self.state.on_activity();
                            awaiting_pong = false;
                        }
                        Some(Err(e)) => return Err(ProtocolError::from(e).into()),
                    }
                }

                event = subscription.recv() => {
                    match event {
                        Ok(event) => self.forward(&event, ws_sender).await?,
                        Err(ChannelError::Lagged(n)) => {
                            log::warn!(
                                "Session {} lagged by {n} event(s) on {}, re-reading from v{}",
                                self.session_id, self.doc_id, self.delivered
                            );
                            counters.lagged_events.fetch_add(n, Ordering::Relaxed);
                            if let Err(e) = self.catch_up(ws_sender).await {
                                log::error!("Catch-up for session {} failed: {e}", self.session_id);
                                return Err(e);
                            }
                        }
                        Err(ChannelError::Closed) => return Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        self.state = self.state.on_missed_heartbeat(config.max_missed_heartbeats);
                        log::warn!("Session {} missed a heartbeat ({:?})", self.session_id, self.state);
                        if self.state.is_closed() {
                            log::info!("Session {} timed out", self.session_id);
                            return Ok(());
                        }
                    }
                    nonce += 1;
                    awaiting_pong = true;
                    send(ws_sender, &SyncMessage::Ping { nonce }).await?;
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        msg: SyncMessage,
        ws_sender: &mut WsSink,
        counters: &ServerCounters,
    ) -> SyncResult<()> {
        match msg {
            SyncMessage::Submit {
                request_id,
                base_version,
                changes,
            } => {
                let count = changes.len() as u64;
                let outcome = self
                    .hub
                    .submit(self.doc_id, &self.identity, Some(self.session_id), base_version, changes)
                    .await;
                let reply = match outcome {
                    Ok(Reconciliation::Accepted { new_version, .. }) => {
                        counters.accepted_changes.fetch_add(count, Ordering::Relaxed);
                        // The client learns these from the reply, not the channel.
                        self.delivered = self.delivered.max(new_version);
                        SyncMessage::ChangeAccepted {
                            request_id,
                            version: new_version,
                            count,
                        }
                    }
                    Ok(Reconciliation::Conflict {
                        current_version,
                        server_changes,
                    }) => {
                        counters.rejected_submissions.fetch_add(1, Ordering::Relaxed);
                        self.delivered = self.delivered.max(current_version);
                        SyncMessage::ChangeRejected {
                            request_id,
                            current_version,
                            server_changes: self.limits.page(server_changes),
                        }
                    }
                    Err(e) => SyncMessage::error(&e),
                };
                send(ws_sender, &reply).await
            }

            SyncMessage::CatchUp { since } => {
                let reply = match self.hub.read_since(self.doc_id, &self.identity, since) {
                    Ok((current_version, changes)) => {
                        self.delivered = self.delivered.max(current_version);
                        SyncMessage::CaughtUp {
                            current_version,
                            changes: self.limits.page(changes),
                        }
                    }
                    Err(e) => SyncMessage::error(&e),
                };
                send(ws_sender, &reply).await
            }

            SyncMessage::Ping { nonce } => send(ws_sender, &SyncMessage::Pong { nonce }).await,

            SyncMessage::Pong { .. } => {
                self.hub.touch(self.doc_id, self.session_id);
                Ok(())
            }

            other => {
                log::warn!("Session {} sent unexpected {}", self.session_id, other.name());
                let err = SyncError::ValidationFailure(format!("unexpected {}", other.name()));
                send(ws_sender, &SyncMessage::error(&err)).await
            }
        }
    }

    /// Forward one channel event to the client.
    async fn forward(&mut self, event: &ChannelEvent, ws_sender: &mut WsSink) -> SyncResult<()> {
        match event {
            ChannelEvent::Change { origin, change } => {
                if *origin == Some(self.session_id) {
                    // Own submission: the client learns it from ChangeAccepted.
                    self.delivered = self.delivered.max(change.version);
                    return Ok(());
                }
                if change.version <= self.delivered {
                    return Ok(());
                }
                if change.version > self.delivered + 1 {
                    return self.catch_up(ws_sender).await;
                }
                self.deliver(change.clone(), ws_sender).await
            }
            ChannelEvent::Presence { kind, entry } => {
                if entry.session_id == self.session_id {
                    return Ok(());
                }
                let msg = SyncMessage::PresenceUpdate {
                    kind: *kind,
                    entry: entry.clone(),
                };
                send(ws_sender, &msg).await
            }
        }
    }

    async fn deliver(&mut self, change: Change, ws_sender: &mut WsSink) -> SyncResult<()> {
        let version = change.version;
        send(ws_sender, &SyncMessage::RemoteChange(change)).await?;
        self.delivered = version;
        Ok(())
    }

    /// Re-read everything after `delivered` from the change log.
    async fn catch_up(&mut self, ws_sender: &mut WsSink) -> SyncResult<()> {
        let (_, changes) = self
            .hub
            .read_since(self.doc_id, &self.identity, self.delivered)?;
        for change in changes {
            self.deliver(change, ws_sender).await?;
        }
        Ok(())
    }
}
