//! Client sync agent.
//!
//! A [`SyncClient`] is a cheap handle; all protocol work happens on one
//! spawned event loop that owns the socket, the timers and the
//! [`AgentState`] machine. The pending queue is the only state the handle
//! and the loop both touch.
//!
//! ```text
//!  edit() ──► PendingQueue ──nudge──►┐
//!                                    │  event loop (one task)
//!  connect()/disconnect() ──command─►│  select! { socket frame, command,
//!                                    │            request deadline, heartbeat }
//!  SyncEvent ◄───────────────────────┘
//! ```
//!
//! Edits are applied optimistically: `edit` reports `LocalApplied` at once
//! and the loop submits the queue head against the last known version. A
//! rejection applies the server's changes and resubmits the same edits
//! against the new base until one goes through.
//!
//! Reference: Kleppmann, Chapter 5 (Replication)

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::identity::Credentials;
use crate::model::{AccessLevel, Change, PendingChange, PresenceEntry};
use crate::pending::PendingQueue;
use crate::presence::{PresenceKind, PresenceRoster};
use crate::protocol::{Limits, ProtocolError, SyncMessage};
use crate::reconnect::{AgentEvent, AgentState, Backoff};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the sync server, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub doc_id: Uuid,
    pub credentials: Credentials,
    /// Version the local copy already reflects
    pub base_version: u64,
    /// Deadline for Join, Submit and CatchUp replies
    pub request_timeout: Duration,
    /// Silence from the server after which the connection is presumed dead
    pub heartbeat_timeout: Duration,
    pub max_pending: usize,
    /// Frame and payload limits; must match the server's
    pub limits: Limits,
    pub backoff: Backoff,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, doc_id: Uuid, credentials: Credentials) -> Self {
        Self {
            server_url: server_url.into(),
            doc_id,
            credentials,
            base_version: 0,
            request_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(90),
            max_pending: 10_000,
            limits: Limits::default(),
            backoff: Backoff::default(),
        }
    }

    #[must_use]
    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = version;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    #[must_use]
    pub fn with_max_batch_len(mut self, max: usize) -> Self {
        self.limits.max_batch_len = max.max(1);
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(AgentState),
    /// A local edit was queued and may be shown immediately.
    LocalApplied(PendingChange),
    /// A change from another writer, in version order.
    RemoteChange(Change),
    /// `count` queued edits were accepted; the document is now at `version`.
    Acknowledged { version: u64, count: usize },
    /// A submission lost a race; `applied` server changes were applied and
    /// the queue will be resubmitted on top of `current_version`.
    Rebased { current_version: u64, applied: usize },
    PresenceJoined(PresenceEntry),
    PresenceLeft(PresenceEntry),
    /// Retries exhausted. `pending` edits are still queued.
    Failed { pending: usize },
    /// A non-retryable error from the server.
    Error(SyncError),
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Flush,
    Shutdown,
}

struct Shared {
    state: parking_lot::RwLock<AgentState>,
    base_version: AtomicU64,
    roster: parking_lot::Mutex<PresenceRoster>,
}

/// Handle to a client sync agent.
pub struct SyncClient {
    doc_id: Uuid,
    server_url: String,
    limits: Limits,
    shared: Arc<Shared>,
    queue: Arc<Mutex<PendingQueue>>,
    commands: mpsc::Sender<Command>,
    events: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Create the agent and spawn its event loop. Starts `Disconnected`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(64);
        let shared = Arc::new(Shared {
            state: parking_lot::RwLock::new(AgentState::Disconnected),
            base_version: AtomicU64::new(config.base_version),
            roster: parking_lot::Mutex::new(PresenceRoster::new()),
        });
        let queue = Arc::new(Mutex::new(PendingQueue::new(config.max_pending)));

        let doc_id = config.doc_id;
        let server_url = config.server_url.clone();
        let limits = config.limits;
        let agent = AgentLoop {
            config,
            shared: shared.clone(),
            queue: queue.clone(),
            events: event_tx.clone(),
            commands: command_rx,
            submit: None,
            catching_up: false,
            deadline: None,
            stalled_at: None,
        };
        let task = tokio::spawn(agent.run());

        Self {
            doc_id,
            server_url,
            limits,
            shared,
            queue,
            commands: command_tx,
            events: event_tx,
            event_rx: Some(event_rx),
            task: Some(task),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Record a local edit. Works in every state; the edit is sent when the
    /// agent is connected. A payload over the size limit is refused here and
    /// never queued.
    pub async fn edit(&self, payload: Vec<u8>) -> SyncResult<PendingChange> {
        self.limits.check_payload(&payload)?;
        let change = PendingChange::new(payload);
        self.queue.lock().await.enqueue(change.clone())?;
        let _ = self.events.send(SyncEvent::LocalApplied(change.clone()));
        // A nudge already waiting covers this edit too.
        let _ = self.commands.try_send(Command::Flush);
        Ok(change)
    }

    pub async fn connect(&self) -> SyncResult<()> {
        self.command(Command::Connect).await
    }

    /// Close the connection and cancel any scheduled retry. Queued edits
    /// stay queued.
    pub async fn disconnect(&self) -> SyncResult<()> {
        self.command(Command::Disconnect).await
    }

    /// Stop the event loop and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn command(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::TransportFailure("sync agent stopped".into()))
    }

    pub fn state(&self) -> AgentState {
        *self.shared.state.read()
    }

    /// Last version the local copy is known to reflect.
    pub fn base_version(&self) -> u64 {
        self.shared.base_version.load(Ordering::SeqCst)
    }

    pub async fn pending_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Other sessions currently on the document.
    pub fn presence(&self) -> Vec<PresenceEntry> {
        self.shared.roster.lock().peers()
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

// ─── Event loop ───────────────────────────────────────────────────

/// Why a connection ended.
enum Exit {
    Lost(SyncError),
    Fatal(SyncError),
    Disconnect,
    Shutdown,
}

impl From<SyncError> for Exit {
    fn from(err: SyncError) -> Self {
        if err.is_retryable() {
            Exit::Lost(err)
        } else {
            Exit::Fatal(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Remote,
    /// One of our own queued edits, accepted before its ack was lost.
    Own,
    Duplicate,
    Gap,
}

struct InFlight {
    request_id: Uuid,
    count: usize,
}

struct Connection {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    session_id: Uuid,
    access: AccessLevel,
    /// The Join replay did not reach the server's version.
    behind: bool,
}

struct AgentLoop {
    config: ClientConfig,
    shared: Arc<Shared>,
    queue: Arc<Mutex<PendingQueue>>,
    events: mpsc::UnboundedSender<SyncEvent>,
    commands: mpsc::Receiver<Command>,
    submit: Option<InFlight>,
    catching_up: bool,
    /// Reply deadline for the outstanding Submit or CatchUp.
    deadline: Option<Instant>,
    /// Retry count the current connection was opened with, until the
    /// server sends something after `Joined`.
    stalled_at: Option<u32>,
}

impl AgentLoop {
    async fn run(mut self) {
        loop {
            let exit = match self.state() {
                AgentState::Disconnected | AgentState::Failed => match self.commands.recv().await {
                    Some(Command::Connect) => {
                        self.transition(AgentEvent::Connect);
                        continue;
                    }
                    Some(Command::Disconnect) => {
                        self.transition(AgentEvent::Disconnect);
                        continue;
                    }
                    Some(Command::Flush) => continue,
                    Some(Command::Shutdown) | None => break,
                },
                AgentState::Connecting | AgentState::Connected => self.connect_and_sync().await,
                AgentState::Reconnecting { attempt } => {
                    let Some(delay) = self.config.backoff.delay(attempt) else {
                        self.transition(AgentEvent::RetriesExhausted);
                        let pending = self.queue.lock().await.len();
                        log::warn!(
                            "Giving up on {} after {attempt} retries ({pending} edits still queued)",
                            self.config.doc_id
                        );
                        self.emit(SyncEvent::Failed { pending });
                        continue;
                    };
                    self.transition(AgentEvent::RetryScheduled);
                    log::info!(
                        "Reconnecting to {} in {delay:?} (attempt {})",
                        self.config.server_url,
                        attempt + 1
                    );
                    match self.wait(delay).await {
                        Some(exit) => exit,
                        None => self.connect_and_sync().await,
                    }
                }
            };

            match exit {
                Exit::Lost(e) => {
                    log::warn!("Connection for {} lost: {e}", self.config.doc_id);
                    let event = match (self.state(), self.stalled_at.take()) {
                        (AgentState::Connected, Some(attempt)) => AgentEvent::Stalled { attempt },
                        _ => AgentEvent::TransportFailed,
                    };
                    self.transition(event);
                }
                Exit::Fatal(e) => {
                    log::error!("Sync of {} stopped: {e}", self.config.doc_id);
                    self.emit(SyncEvent::Error(e));
                    self.transition(AgentEvent::Disconnect);
                }
                Exit::Disconnect => self.transition(AgentEvent::Disconnect),
                Exit::Shutdown => break,
            }
        }
        log::debug!("Sync agent for {} stopped", self.config.doc_id);
    }

    /// Backoff sleep, cut short by `disconnect` or shutdown.
    async fn wait(&mut self, delay: Duration) -> Option<Exit> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Disconnect) => return Some(Exit::Disconnect),
                    Some(Command::Shutdown) | None => return Some(Exit::Shutdown),
                    Some(Command::Connect) | Some(Command::Flush) => {}
                },
            }
        }
    }

    async fn connect_and_sync(&mut self) -> Exit {
        let attempt = match self.state() {
            AgentState::Reconnecting { attempt } => attempt,
            _ => 0,
        };
        let mut conn = match self.handshake().await {
            Ok(conn) => conn,
            Err(e) => return e.into(),
        };
        self.transition(AgentEvent::Opened);
        self.stalled_at = Some(attempt);
        log::info!(
            "Joined {} as {} (session {}, v{})",
            self.config.doc_id,
            conn.access,
            conn.session_id,
            self.base()
        );

        let exit = self.sync(&mut conn).await;

        let _ = conn.sink.send(Message::Close(None)).await;
        self.submit = None;
        self.catching_up = false;
        self.deadline = None;
        self.shared.roster.lock().clear();
        exit
    }

    async fn handshake(&mut self) -> SyncResult<Connection> {
        let timeout = self.config.request_timeout;
        let (ws_stream, _) = tokio::time::timeout(
            timeout,
            tokio_tungstenite::connect_async_with_config(
                self.config.server_url.as_str(),
                Some(self.config.limits.websocket_config()),
                false,
            ),
        )
        .await
        .map_err(|_| ProtocolError::Timeout)?
        .map_err(ProtocolError::from)?;
        let (mut sink, mut stream) = ws_stream.split();

        let join = SyncMessage::join(
            self.config.doc_id,
            self.config.credentials.clone(),
            self.base(),
        );
        send(&mut sink, &join).await?;

        let reply = tokio::time::timeout(timeout, next_message(&mut stream))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        match reply {
            SyncMessage::Joined {
                session_id,
                access,
                current_version,
                missed,
                presence,
            } => {
                for change in missed {
                    self.apply_remote(change).await;
                }
                self.shared.roster.lock().reset(session_id, presence);
                Ok(Connection {
                    sink,
                    stream,
                    session_id,
                    access,
                    behind: self.base() < current_version,
                })
            }
            SyncMessage::Error {
                kind,
                message,
                current_version,
            } => Err(SyncError::from_wire(kind, message, current_version)),
            other => Err(ProtocolError::Unexpected(other.name().to_string()).into()),
        }
    }

    async fn sync(&mut self, conn: &mut Connection) -> Exit {
        let resumed = if conn.behind {
            self.catch_up(conn).await
        } else {
            self.flush(conn).await
        };
        if let Err(e) = resumed {
            return e.into();
        }

        let mut last_heard = Instant::now();
        loop {
            let heartbeat_deadline = last_heard + self.config.heartbeat_timeout;
            let request_deadline = self.deadline;

            tokio::select! {
                frame = conn.stream.next() => {
                    last_heard = Instant::now();
                    let result = match frame {
                        Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                            Ok(msg) => {
                                self.stalled_at = None;
                                self.handle_message(conn, msg).await
                            }
                            Err(e) => Err(e.into()),
                        },
                        Some(Ok(Message::Close(_))) | None => Err(ProtocolError::ConnectionClosed.into()),
                        Some(Ok(_)) => Ok(()),
                        Some(Err(e)) => Err(ProtocolError::from(e).into()),
                    };
                    if let Err(e) = result {
                        return e.into();
                    }
                }

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Flush) => {
                        if let Err(e) = self.flush(conn).await {
                            return e.into();
                        }
                    }
                    Some(Command::Connect) => {}
                    Some(Command::Disconnect) => return Exit::Disconnect,
                    Some(Command::Shutdown) | None => return Exit::Shutdown,
                },

                _ = tokio::time::sleep_until(request_deadline.unwrap_or(heartbeat_deadline)), if request_deadline.is_some() => {
                    return Exit::Lost(SyncError::TransportFailure("request timed out".into()));
                }

                _ = tokio::time::sleep_until(heartbeat_deadline) => {
                    return Exit::Lost(SyncError::TransportFailure("server went silent".into()));
                }
            }
        }
    }

    async fn handle_message(&mut self, conn: &mut Connection, msg: SyncMessage) -> SyncResult<()> {
        match msg {
            SyncMessage::ChangeAccepted {
                request_id,
                version,
                count,
            } => {
                if !self.take_in_flight(request_id) {
                    log::warn!("Ignoring acknowledgement for unknown request {request_id}");
                    return Ok(());
                }
                // Base first: an empty queue implies the version is current.
                self.set_base(version);
                let acked = self.queue.lock().await.acknowledge(count as usize);
                self.settle_deadline();
                log::debug!("{} edits accepted, now at v{version}", acked.len());
                self.emit(SyncEvent::Acknowledged {
                    version,
                    count: acked.len(),
                });
                self.flush(conn).await
            }

            SyncMessage::ChangeRejected {
                request_id,
                current_version,
                server_changes,
            } => {
                if !self.take_in_flight(request_id) {
                    log::warn!("Ignoring rejection for unknown request {request_id}");
                    return Ok(());
                }
                self.settle_deadline();
                let mut applied = 0;
                for change in server_changes {
                    if self.apply_remote(change).await == Applied::Remote {
                        applied += 1;
                    }
                }
                log::debug!("Submission rejected at v{current_version}, rebasing over {applied} changes");
                self.emit(SyncEvent::Rebased {
                    current_version,
                    applied,
                });
                if self.base() < current_version {
                    self.catch_up(conn).await
                } else {
                    self.flush(conn).await
                }
            }

            SyncMessage::RemoteChange(change) => {
                if self.apply_remote(change).await == Applied::Gap {
                    self.catch_up(conn).await?;
                }
                Ok(())
            }

            SyncMessage::CaughtUp {
                current_version,
                changes,
            } => {
                self.catching_up = false;
                self.settle_deadline();
                let before = self.base();
                for change in changes {
                    self.apply_remote(change).await;
                }
                if self.base() < current_version {
                    if self.base() == before {
                        return Err(SyncError::Corrupt(format!(
                            "catch-up stalled at v{before} short of v{current_version}"
                        )));
                    }
                    // One page applied; ask for the next.
                    return self.catch_up(conn).await;
                }
                self.flush(conn).await
            }

            SyncMessage::PresenceUpdate { kind, entry } => {
                if self.shared.roster.lock().apply(kind, entry.clone()) {
                    self.emit(match kind {
                        PresenceKind::Joined => SyncEvent::PresenceJoined(entry),
                        PresenceKind::Left => SyncEvent::PresenceLeft(entry),
                    });
                }
                Ok(())
            }

            SyncMessage::Ping { nonce } => send(&mut conn.sink, &SyncMessage::Pong { nonce }).await,

            SyncMessage::Pong { .. } => Ok(()),

            SyncMessage::Error {
                kind,
                message,
                current_version,
            } => Err(SyncError::from_wire(kind, message, current_version)),

            other => Err(ProtocolError::Unexpected(other.name().to_string()).into()),
        }
    }

    /// Apply one authoritative change if it is the next in sequence.
    async fn apply_remote(&self, change: Change) -> Applied {
        let base = self.base();
        if change.version <= base {
            return Applied::Duplicate;
        }
        if change.version != base + 1 {
            return Applied::Gap;
        }
        self.set_base(change.version);

        if self.queue.lock().await.acknowledge_if_head(change.id) {
            self.emit(SyncEvent::Acknowledged {
                version: change.version,
                count: 1,
            });
            return Applied::Own;
        }
        self.emit(SyncEvent::RemoteChange(change));
        Applied::Remote
    }

    /// Submit the queue head unless a request is already outstanding.
    async fn flush(&mut self, conn: &mut Connection) -> SyncResult<()> {
        if self.submit.is_some() || self.catching_up {
            return Ok(());
        }
        let changes = self.queue.lock().await.snapshot(&self.config.limits);
        if changes.is_empty() {
            return Ok(());
        }

        let request_id = Uuid::new_v4();
        let count = changes.len();
        let base_version = self.base();
        send(
            &mut conn.sink,
            &SyncMessage::Submit {
                request_id,
                base_version,
                changes,
            },
        )
        .await?;
        log::debug!("Submitted {count} edits on v{base_version}");
        self.submit = Some(InFlight { request_id, count });
        self.deadline = Some(Instant::now() + self.config.request_timeout);
        Ok(())
    }

    async fn catch_up(&mut self, conn: &mut Connection) -> SyncResult<()> {
        if self.catching_up {
            return Ok(());
        }
        let since = self.base();
        send(&mut conn.sink, &SyncMessage::CatchUp { since }).await?;
        log::debug!("Catching up from v{since}");
        self.catching_up = true;
        self.deadline = Some(Instant::now() + self.config.request_timeout);
        Ok(())
    }

    fn take_in_flight(&mut self, request_id: Uuid) -> bool {
        match &self.submit {
            Some(in_flight) if in_flight.request_id == request_id => {
                log::trace!("Request {request_id} settled ({} edits)", in_flight.count);
                self.submit = None;
                true
            }
            _ => false,
        }
    }

    fn settle_deadline(&mut self) {
        if self.submit.is_none() && !self.catching_up {
            self.deadline = None;
        }
    }

    fn state(&self) -> AgentState {
        *self.shared.state.read()
    }

    fn transition(&self, event: AgentEvent) {
        let mut state = self.shared.state.write();
        let Some(next) = state.on(event) else {
            log::debug!("Ignoring {event:?} while {}", state.name());
            return;
        };
        if next == *state {
            return;
        }
        log::debug!("Agent {} -> {} on {event:?}", state.name(), next.name());
        *state = next;
        drop(state);
        self.emit(SyncEvent::StateChanged(next));
    }

    fn base(&self) -> u64 {
        self.shared.base_version.load(Ordering::SeqCst)
    }

    fn set_base(&self, version: u64) {
        self.shared.base_version.store(version, Ordering::SeqCst);
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

async fn send(sink: &mut SplitSink<WsStream, Message>, msg: &SyncMessage) -> SyncResult<()> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into()))
        .await
        .map_err(ProtocolError::from)?;
    Ok(())
}

/// Next protocol message, skipping control frames.
async fn next_message(stream: &mut SplitStream<WsStream>) -> SyncResult<SyncMessage> {
    while let Some(frame) = stream.next().await {
        match frame.map_err(ProtocolError::from)? {
            Message::Binary(data) => return Ok(SyncMessage::decode(&data)?),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ProtocolError::ConnectionClosed.into())
}
