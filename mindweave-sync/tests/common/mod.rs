//! Shared helpers: a real server on a free port and connected clients.

#![allow(dead_code)]

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use mindweave_sync::{
    AccessLevel, AgentState, ClientConfig, CollabHub, Credentials, Document, Identity, ServerConfig,
    SyncClient, SyncEvent, SyncMessage, SyncServer,
};

/// Client end of a hand-driven protocol connection.
pub type RawClient = WebSocketStream<MaybeTlsStream<TcpStream>>;
/// Server end of a scripted connection.
pub type RawServer = WebSocketStream<TcpStream>;

pub const WAIT: Duration = Duration::from_secs(5);

/// Start a server on a free port, return its URL and hub.
pub async fn start_test_server() -> (String, Arc<CollabHub>) {
    start_server_with(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        broadcast_capacity: 64,
        ..ServerConfig::default()
    })
    .await
}

pub async fn start_server_with(config: ServerConfig) -> (String, Arc<CollabHub>) {
    let (url, server) = start_server_handle(config).await;
    (url, server.hub().clone())
}

/// Like [`start_server_with`], keeping the server for its stats.
pub async fn start_server_handle(config: ServerConfig) -> (String, SyncServer) {
    let server = SyncServer::new(config).unwrap();
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), server)
}

/// Run `script` on every accepted connection. Returns the URL.
pub async fn scripted_server<F, Fut>(script: F) -> String
where
    F: Fn(RawServer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let script = Arc::new(script);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let script = script.clone();
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    script(ws).await;
                }
            });
        }
    });
    format!("ws://127.0.0.1:{port}")
}

pub async fn send_msg<S>(ws: &mut S, msg: &SyncMessage)
where
    S: Sink<Message> + Unpin,
    S::Error: Debug,
{
    ws.send(Message::Binary(msg.encode().unwrap().into()))
        .await
        .unwrap();
}

/// Next protocol message, or `None` once the peer is gone.
pub async fn next_msg<S>(ws: &mut S) -> Option<SyncMessage>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(Ok(frame)) = ws.next().await {
        match frame {
            Message::Binary(data) => return Some(SyncMessage::decode(&data).unwrap()),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

pub async fn recv_msg<S>(ws: &mut S) -> SyncMessage
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    timeout(WAIT, next_msg(ws))
        .await
        .expect("no frame in time")
        .expect("connection closed")
}

/// Open a raw protocol connection and join `doc_id`; returns the `Joined` reply.
pub async fn raw_join(url: &str, doc_id: Uuid, identity: &Identity, last_version: u64) -> (RawClient, SyncMessage) {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let join = SyncMessage::join(doc_id, Credentials::claim(identity.clone()), last_version);
    send_msg(&mut ws, &join).await;
    let joined = recv_msg(&mut ws).await;
    assert_eq!(joined.name(), "Joined");
    (ws, joined)
}

/// A document owned by `owner` with `editors` granted edit access.
pub fn shared_document(hub: &CollabHub, owner: &Identity, editors: &[&Identity]) -> Document {
    let doc = hub.create_document(owner, "Team map").unwrap();
    for editor in editors {
        hub.access()
            .update_access(owner, doc.id, editor.id, AccessLevel::Edit)
            .unwrap();
    }
    doc
}

pub fn client_config(url: &str, doc_id: Uuid, identity: &Identity) -> ClientConfig {
    ClientConfig::new(url, doc_id, Credentials::claim(identity.clone()))
}

/// Connect a client and wait until it has joined.
pub async fn connect_client(
    url: &str,
    doc_id: Uuid,
    identity: &Identity,
) -> (SyncClient, UnboundedReceiver<SyncEvent>) {
    connect_with(client_config(url, doc_id, identity)).await
}

pub async fn connect_with(config: ClientConfig) -> (SyncClient, UnboundedReceiver<SyncEvent>) {
    let mut client = SyncClient::new(config);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| *e == SyncEvent::StateChanged(AgentState::Connected)).await;
    (client, events)
}

/// Next event matching `pred`, skipping the rest.
pub async fn wait_for<F>(events: &mut UnboundedReceiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Wait until the client has no unacknowledged edits.
pub async fn wait_synced(client: &SyncClient) {
    wait_synced_within(client, WAIT).await
}

pub async fn wait_synced_within(client: &SyncClient, limit: Duration) {
    timeout(limit, async {
        while client.pending_len().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue did not drain");
}

/// Wait until the client's local copy reaches `version`.
pub async fn wait_version(client: &SyncClient, version: u64) {
    wait_version_within(client, version, WAIT).await
}

pub async fn wait_version_within(client: &SyncClient, version: u64, limit: Duration) {
    timeout(limit, async {
        while client.base_version() < version {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("version not reached");
}

/// Everything buffered right now.
pub fn drain(events: &mut UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
