//! Integration tests against a real relay over WebSocket.
//!
//! A relay is bound on an ephemeral port and clients connect with
//! `WebSocketTransport`, covering the same path production traffic takes.

use std::sync::Arc;

use quire_collab::client::CollabClient;
use quire_collab::config::CollabConfig;
use quire_collab::connection::ConnectionStatus;
use quire_collab::protocol::{CursorPosition, Envelope, Identity};
use quire_collab::relay::RelayServer;
use quire_collab::sharing::{ContentRef, ShareInvite};
use quire_collab::storage::MemoryStore;
use quire_collab::transport::{Inbound, Transport, WebSocketTransport};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

/// Start a relay on a free port, return it with its ws:// URL.
async fn start_relay() -> (Arc<RelayServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(RelayServer::with_defaults());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url)
}

async fn recv(rx: &mut mpsc::Receiver<Inbound>) -> Inbound {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("inbound closed")
}

// ─── Raw transport ───────────────────────────────────────────────

#[tokio::test]
async fn test_publish_reaches_subscribers() {
    let (server, url) = start_relay().await;
    let alice = WebSocketTransport::new(url.clone());
    let bob = WebSocketTransport::new(url);

    let (alice_tx, mut alice_rx) = mpsc::channel(16);
    let (bob_tx, mut bob_rx) = mpsc::channel(16);
    alice.connect(alice_tx).await.unwrap();
    bob.connect(bob_tx).await.unwrap();

    alice.subscribe("document:doc-1").await.unwrap();
    bob.subscribe("document:doc-1").await.unwrap();

    let payload = Envelope::heartbeat("alice").encode().unwrap();
    alice.publish("document:doc-1", payload.clone()).await.unwrap();

    let delivered = recv(&mut bob_rx).await;
    assert_eq!(delivered.topic, "document:doc-1");
    assert_eq!(delivered.payload, payload);
    // The relay echoes to the publisher as well
    assert_eq!(recv(&mut alice_rx).await.payload, payload);

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert!(stats.total_frames >= 3);
}

#[tokio::test]
async fn test_topics_are_isolated() {
    let (_server, url) = start_relay().await;
    let alice = WebSocketTransport::new(url.clone());
    let bob = WebSocketTransport::new(url);
    let (alice_tx, _alice_rx) = mpsc::channel(16);
    let (bob_tx, mut bob_rx) = mpsc::channel(16);
    alice.connect(alice_tx).await.unwrap();
    bob.connect(bob_tx).await.unwrap();

    bob.subscribe("document:doc-1").await.unwrap();
    alice.publish("document:doc-2", b"elsewhere".to_vec()).await.unwrap();
    alice.publish("document:doc-1", b"here".to_vec()).await.unwrap();

    assert_eq!(recv(&mut bob_rx).await.payload, b"here".to_vec());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (server, url) = start_relay().await;
    let alice = WebSocketTransport::new(url.clone());
    let bob = WebSocketTransport::new(url);
    let (alice_tx, _alice_rx) = mpsc::channel(16);
    let (bob_tx, mut bob_rx) = mpsc::channel(16);
    alice.connect(alice_tx).await.unwrap();
    bob.connect(bob_tx).await.unwrap();

    bob.subscribe("document:doc-1").await.unwrap();
    bob.unsubscribe("document:doc-1").await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.topics().topic_count().await, 0);

    alice.publish("document:doc-1", b"lost".to_vec()).await.unwrap();
    assert!(timeout(Duration::from_millis(200), bob_rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_disconnect_releases_relay_state() {
    let (server, url) = start_relay().await;
    let alice = WebSocketTransport::new(url);
    let (tx, _rx) = mpsc::channel(16);
    alice.connect(tx).await.unwrap();
    alice.subscribe("document:doc-1").await.unwrap();
    assert_eq!(server.stats().await.active_connections, 1);

    alice.disconnect().await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(server.stats().await.active_connections, 0);
    assert_eq!(server.topics().topic_count().await, 0);
    assert!(alice.publish("document:doc-1", vec![1]).await.is_err());
}

// ─── Full stack ──────────────────────────────────────────────────

#[tokio::test]
async fn test_presence_over_relay() {
    let (_server, url) = start_relay().await;
    let store = Arc::new(MemoryStore::new());
    store.register_owner(ContentRef::document("doc-1"), "A").await;

    let ada = CollabClient::with_store(
        Identity::new("A", "Ada"),
        WebSocketTransport::new(url.clone()),
        store.clone(),
        CollabConfig::default(),
    );
    let bea = CollabClient::with_store(
        Identity::new("B", "Bea").with_email("bea@quire.dev"),
        WebSocketTransport::new(url),
        store,
        CollabConfig::default(),
    );
    let share = ada
        .sharing()
        .create_share(
            ada.identity(),
            ShareInvite::new(ContentRef::document("doc-1"), "bea@quire.dev", "view"),
        )
        .await
        .unwrap();
    bea.sharing().accept_share(bea.identity(), share.id).await.unwrap();

    ada.connect().await.unwrap();
    bea.connect().await.unwrap();
    assert_eq!(bea.connection_status(), ConnectionStatus::Connected);

    let _b = bea.join_document("doc-1").await.unwrap();
    let a = ada.join_document("doc-1").await.unwrap();
    a.send_cursor_position(&CursorPosition::new("p1", 5)).unwrap();

    let seen = timeout(Duration::from_secs(3), async {
        loop {
            let others = bea.other_collaborators("doc-1").await;
            if let Some(ada) = others.iter().find(|c| c.cursor.is_some()) {
                return ada.clone();
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("cursor never arrived");

    assert_eq!(seen.user_id, "A");
    assert_eq!(seen.user_name, "Ada");
    assert_eq!(seen.cursor, Some(CursorPosition::new("p1", 5)));
    assert!(seen.is_active());
}
