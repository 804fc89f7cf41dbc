//! Integration tests for end-to-end presence sharing.
//!
//! These tests start a real hub and connect real clients, verifying the
//! full report → roster → broadcast pipeline over actual WebSockets.

use geosync::channel::{ChannelEvent, ConnectionState, SyncChannel};
use geosync::hub::{HubConfig, PresenceHub};
use geosync::protocol::{ClientReport, GeoPosition, PresenceSnapshot};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a hub on a free port, return the port and a handle to it.
async fn start_test_hub() -> (u16, Arc<PresenceHub>) {
    let port = free_port().await;
    let config = HubConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
    };
    let hub = Arc::new(PresenceHub::new(config));
    let hub_runner = hub.clone();
    tokio::spawn(async move {
        hub_runner.run().await.unwrap();
    });
    // Give the hub time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, hub)
}

/// Connect a channel to the test hub, draining the initial Connected event
/// but leaving the greeting snapshot in the queue.
async fn connect_channel(
    id: &str,
    url: &str,
) -> (SyncChannel, tokio::sync::mpsc::Receiver<ChannelEvent>) {
    let mut channel = SyncChannel::new(id, url);
    let mut events = channel.take_event_rx().unwrap();
    channel.connect().await.unwrap();
    match timeout(Duration::from_secs(1), events.recv()).await {
        Ok(Some(ChannelEvent::Connected)) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    (channel, events)
}

/// Wait for the next snapshot event, skipping nothing.
async fn next_snapshot(
    events: &mut tokio::sync::mpsc::Receiver<ChannelEvent>,
) -> PresenceSnapshot {
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ChannelEvent::Snapshot(snapshot))) => snapshot,
        other => panic!("Expected Snapshot event, got {other:?}"),
    }
}

/// Keep taking snapshots until one satisfies `pred`.
async fn snapshot_matching(
    events: &mut tokio::sync::mpsc::Receiver<ChannelEvent>,
    pred: impl Fn(&PresenceSnapshot) -> bool,
) -> PresenceSnapshot {
    for _ in 0..10 {
        let snapshot = next_snapshot(events).await;
        if pred(&snapshot) {
            return snapshot;
        }
    }
    panic!("No matching snapshot within 10 messages");
}

#[tokio::test]
async fn test_hub_accepts_connections() {
    let (port, _hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}/?participant=probe");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to hub");
}

#[tokio::test]
async fn test_hub_rejects_handshake_without_participant_id() {
    let (port, _hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}");

    // No ?participant= in the URI: the upgrade must be refused.
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err(), "Handshake without id should be rejected");
}

#[tokio::test]
async fn test_greeting_snapshot_on_connect() {
    let (port, _hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (_channel, mut events) = connect_channel("first", &url).await;

    // An empty hub greets with the empty snapshot.
    let greeting = next_snapshot(&mut events).await;
    assert!(greeting.is_empty());
}

#[tokio::test]
async fn test_report_reaches_all_participants() {
    let (port, hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut alice_events) = connect_channel("alice", &url).await;
    let (_bob, mut bob_events) = connect_channel("bob", &url).await;

    // Drain greetings.
    next_snapshot(&mut alice_events).await;
    next_snapshot(&mut bob_events).await;

    alice
        .send_report(GeoPosition::new(10.0, 20.0))
        .await
        .unwrap();

    // Both the reporter and the observer get the full snapshot.
    for events in [&mut alice_events, &mut bob_events] {
        let snapshot = snapshot_matching(events, |s| s.contains("alice")).await;
        let entry = snapshot.get("alice").unwrap();
        assert_eq!(entry.lat, 10.0);
        assert_eq!(entry.lng, 20.0);
    }

    let authoritative = hub.snapshot().await;
    assert!(authoritative.contains("alice"));
}

#[tokio::test]
async fn test_new_participant_sees_existing_state() {
    let (port, _hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut alice_events) = connect_channel("alice", &url).await;
    next_snapshot(&mut alice_events).await;
    alice
        .send_report(GeoPosition::new(10.0, 20.0))
        .await
        .unwrap();
    snapshot_matching(&mut alice_events, |s| s.contains("alice")).await;

    // Bob connects later; his greeting already includes Alice, before he
    // has reported anything himself.
    let (_bob, mut bob_events) = connect_channel("bob", &url).await;
    let greeting = next_snapshot(&mut bob_events).await;
    assert!(greeting.contains("alice"));
    assert_eq!(greeting.get("alice").unwrap().lat, 10.0);
}

#[tokio::test]
async fn test_three_participants_full_scenario() {
    let (port, _hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}");

    // A connects and reports.
    let (alice, mut alice_events) = connect_channel("alice", &url).await;
    next_snapshot(&mut alice_events).await;
    alice
        .send_report(GeoPosition::new(10.0, 20.0))
        .await
        .unwrap();
    snapshot_matching(&mut alice_events, |s| s.contains("alice")).await;

    // B connects and immediately sees A.
    let (_bob, mut bob_events) = connect_channel("bob", &url).await;
    let greeting = next_snapshot(&mut bob_events).await;
    assert!(greeting.contains("alice"));

    // C connects and reports; all three see both A and C.
    let (carol, mut carol_events) = connect_channel("carol", &url).await;
    next_snapshot(&mut carol_events).await;
    carol
        .send_report(GeoPosition::new(11.0, 21.0))
        .await
        .unwrap();

    for events in [&mut alice_events, &mut bob_events, &mut carol_events] {
        let snapshot = snapshot_matching(events, |s| s.contains("carol")).await;
        assert!(snapshot.contains("alice"));
        assert_eq!(snapshot.get("carol").unwrap().lat, 11.0);
    }

    // A disconnects; the next broadcast omits A with no action from B or C.
    let mut alice = alice;
    alice.close().await;
    drop(alice);

    for events in [&mut bob_events, &mut carol_events] {
        let snapshot = snapshot_matching(events, |s| !s.contains("alice")).await;
        assert!(snapshot.contains("carol"));
    }
}

#[tokio::test]
async fn test_eviction_on_disconnect() {
    let (port, hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut alice_events) = connect_channel("alice", &url).await;
    next_snapshot(&mut alice_events).await;
    alice.send_report(GeoPosition::new(1.0, 2.0)).await.unwrap();
    snapshot_matching(&mut alice_events, |s| s.contains("alice")).await;
    assert!(hub.snapshot().await.contains("alice"));

    let mut alice = alice;
    alice.close().await;
    drop(alice);

    // The authoritative map must drop the entry; a ghost marker that
    // outlives its connection is the one unacceptable failure mode.
    timeout(Duration::from_secs(2), async {
        loop {
            if !hub.snapshot().await.contains("alice") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("alice should be evicted after disconnect");

    let stats = hub.stats().await;
    assert_eq!(stats.evictions, 1);
}

#[tokio::test]
async fn test_malformed_report_is_discarded() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (port, hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}/?participant=raw");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    // Greeting.
    let _ = timeout(Duration::from_secs(1), ws.next()).await.unwrap();

    // Garbage does not kill the connection or pollute the roster.
    ws.send(Message::text("this is not json")).await.unwrap();
    ws.send(Message::text(r#"{"lat":"north"}"#)).await.unwrap();

    // A valid report afterwards still works on the same connection.
    let valid = ClientReport::new(5.0, 6.0).encode().unwrap();
    ws.send(Message::text(valid)).await.unwrap();

    let frame = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("snapshot after valid report")
        .unwrap()
        .unwrap();
    let snapshot = PresenceSnapshot::decode(frame.to_text().unwrap()).unwrap();
    assert!(snapshot.contains("raw"));
    assert_eq!(hub.snapshot().await.len(), 1);
}

#[tokio::test]
async fn test_eviction_after_abrupt_socket_loss() {
    use futures_util::SinkExt;
    use tokio_tungstenite::tungstenite::Message;

    let (port, hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}/?participant=vanisher");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let report = ClientReport::new(7.0, 8.0).encode().unwrap();
    ws.send(Message::text(report)).await.unwrap();

    timeout(Duration::from_secs(2), async {
        while !hub.snapshot().await.contains("vanisher") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("report should land in the roster");

    // Leave a Ping in flight and tear the socket down with no close
    // handshake. Whichever way the hub notices (failed Pong write or a
    // dead read), cleanup must still evict the entry.
    ws.send(Message::Ping(vec![1u8].into())).await.unwrap();
    drop(ws);

    timeout(Duration::from_secs(2), async {
        while hub.snapshot().await.contains("vanisher") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("abruptly lost participant should still be evicted");

    timeout(Duration::from_secs(2), async {
        while hub.stats().await.active_connections != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection accounting should drain after abrupt loss");
    assert_eq!(hub.stats().await.evictions, 1);
}

#[tokio::test]
async fn test_last_writer_wins_on_repeat_reports() {
    let (port, hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut alice_events) = connect_channel("alice", &url).await;
    next_snapshot(&mut alice_events).await;

    for i in 0..5 {
        alice
            .send_report(GeoPosition::new(i as f64, 0.0))
            .await
            .unwrap();
    }

    snapshot_matching(&mut alice_events, |s| {
        s.get("alice").is_some_and(|p| p.lat == 4.0)
    })
    .await;

    // One entry per participant, never one per report.
    let authoritative = hub.snapshot().await;
    assert_eq!(authoritative.len(), 1);
    assert_eq!(authoritative.get("alice").unwrap().lat, 4.0);

    let stats = hub.stats().await;
    assert_eq!(stats.reports, 5);
}

#[tokio::test]
async fn test_report_with_level_roundtrips_through_hub() {
    let (port, _hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut alice_events) = connect_channel("alice", &url).await;
    next_snapshot(&mut alice_events).await;

    alice
        .send(ClientReport::with_level(10.0, 20.0, 3))
        .await
        .unwrap();

    let snapshot = snapshot_matching(&mut alice_events, |s| s.contains("alice")).await;
    assert_eq!(snapshot.get("alice").unwrap().level, Some(3));
}

#[tokio::test]
async fn test_channel_reports_disconnect() {
    let (port, hub) = start_test_hub().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut alice_events) = connect_channel("alice", &url).await;
    next_snapshot(&mut alice_events).await;
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);

    drop(hub);

    // Closing our own side surfaces as a Disconnected event once the
    // reader task winds down.
    let mut alice = alice;
    alice.close().await;
    assert_eq!(
        alice.connection_state().await,
        ConnectionState::Disconnected
    );
}
