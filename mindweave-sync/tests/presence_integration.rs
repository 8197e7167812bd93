//! Integration tests for live presence.
//!
//! These tests start a real server and connect several clients,
//! verifying join/leave notifications and the per-client roster.

mod common;

use common::*;
use mindweave_sync::{AgentState, Identity, ServerConfig, SyncEvent};
use tokio::time::Duration;

#[tokio::test]
async fn test_presence_join_broadcast() {
    let (url, hub) = start_test_server().await;
    let alice = Identity::random("Alice");
    let bob = Identity::random("Bob");
    let doc = shared_document(&hub, &alice, &[&bob]);

    let (client_a, mut events_a) = connect_client(&url, doc.id, &alice).await;
    assert!(client_a.presence().is_empty());

    let (client_b, _events_b) = connect_client(&url, doc.id, &bob).await;

    let joined = wait_for(&mut events_a, |e| matches!(e, SyncEvent::PresenceJoined(_))).await;
    match joined {
        SyncEvent::PresenceJoined(entry) => {
            assert_eq!(entry.identity, bob);
            assert_eq!(entry.access, mindweave_sync::AccessLevel::Edit);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Each roster lists the other side only.
    assert_eq!(client_a.presence().len(), 1);
    let b_roster = client_b.presence();
    assert_eq!(b_roster.len(), 1);
    assert_eq!(b_roster[0].identity, alice);
    assert_eq!(hub.presence(doc.id).len(), 2);
}

#[tokio::test]
async fn test_presence_leave_broadcast() {
    let (url, hub) = start_test_server().await;
    let alice = Identity::random("Alice");
    let bob = Identity::random("Bob");
    let doc = shared_document(&hub, &alice, &[&bob]);

    let (client_a, mut events_a) = connect_client(&url, doc.id, &alice).await;
    let (client_b, mut events_b) = connect_client(&url, doc.id, &bob).await;
    wait_for(&mut events_a, |e| matches!(e, SyncEvent::PresenceJoined(_))).await;

    client_b.disconnect().await.unwrap();
    wait_for(&mut events_b, |e| *e == SyncEvent::StateChanged(AgentState::Disconnected)).await;

    let left = wait_for(&mut events_a, |e| matches!(e, SyncEvent::PresenceLeft(_))).await;
    match left {
        SyncEvent::PresenceLeft(entry) => assert_eq!(entry.identity.id, bob.id),
        other => panic!("unexpected {other:?}"),
    }
    assert!(client_a.presence().is_empty());
    assert!(client_b.presence().is_empty());
    assert_eq!(hub.presence(doc.id).len(), 1);
}

#[tokio::test]
async fn test_presence_same_user_two_sessions() {
    let (url, hub) = start_test_server().await;
    let alice = Identity::random("Alice");
    let doc = shared_document(&hub, &alice, &[]);

    let (laptop, mut laptop_events) = connect_client(&url, doc.id, &alice).await;
    let (phone, _phone_events) = connect_client(&url, doc.id, &alice).await;

    // A second device is a separate session, so it shows up.
    wait_for(&mut laptop_events, |e| matches!(e, SyncEvent::PresenceJoined(_))).await;
    assert_eq!(laptop.presence().len(), 1);
    assert_eq!(phone.presence().len(), 1);
    assert_ne!(laptop.presence()[0].session_id, phone.presence()[0].session_id);
}

#[tokio::test]
async fn test_presence_cleared_when_last_member_leaves() {
    let (url, hub) = start_test_server().await;
    let alice = Identity::random("Alice");
    let doc = shared_document(&hub, &alice, &[]);

    let (client, mut events) = connect_client(&url, doc.id, &alice).await;
    assert!(hub.channel_stats(doc.id).is_some());

    client.disconnect().await.unwrap();
    wait_for(&mut events, |e| *e == SyncEvent::StateChanged(AgentState::Disconnected)).await;

    // The server notices the close asynchronously.
    tokio::time::timeout(WAIT, async {
        while hub.channel_stats(doc.id).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel was not released");
    assert!(hub.presence(doc.id).is_empty());
}

#[tokio::test]
async fn test_silent_peer_evicted_by_heartbeat() {
    let (url, hub) = start_server_with(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        heartbeat_interval: Duration::from_millis(50),
        max_missed_heartbeats: 2,
        ..ServerConfig::default()
    })
    .await;
    let alice = Identity::random("Alice");
    let bob = Identity::random("Bob");
    let doc = shared_document(&hub, &alice, &[&bob]);
    let (client_a, mut events_a) = connect_client(&url, doc.id, &alice).await;

    // Bob joins by hand and never answers a ping. The socket stays open.
    let (_bob_ws, _) = raw_join(&url, doc.id, &bob, 0).await;
    wait_for(&mut events_a, |e| matches!(e, SyncEvent::PresenceJoined(_))).await;
    assert_eq!(hub.presence(doc.id).len(), 2);

    let left = wait_for(&mut events_a, |e| matches!(e, SyncEvent::PresenceLeft(_))).await;
    match left {
        SyncEvent::PresenceLeft(entry) => assert_eq!(entry.identity.id, bob.id),
        other => panic!("unexpected {other:?}"),
    }
    assert!(client_a.presence().is_empty());
    assert_eq!(hub.presence(doc.id).len(), 1);
    // Alice answers her pings and stays.
    assert_eq!(client_a.state(), AgentState::Connected);
}
