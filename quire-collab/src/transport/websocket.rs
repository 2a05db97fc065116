//! WebSocket client for the pub/sub relay.
//!
//! One socket per process carries every topic. Frames are bincode
//! [`RelayFrame`]s; envelopes travel opaque inside `Publish.payload`.
//!
//! Provides:
//! - Connect/disconnect with reader and writer tasks
//! - Acknowledged subscribe (`Subscribe` → `Subscribed`)
//! - Drop detection reported as [`TransportEvent::Disconnected`]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{Inbound, Transport, TransportEvent};
use crate::error::ConnectionError;
use crate::protocol::RelayFrame;

type PendingAcks = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>>;

#[derive(Default)]
struct Socket {
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    /// Set before a local close so the reader does not report a drop.
    closing: Arc<AtomicBool>,
}

/// Relay client.
pub struct WebSocketTransport {
    url: String,
    ack_timeout: Duration,
    socket: Mutex<Socket>,
    pending_acks: PendingAcks,
    events: broadcast::Sender<TransportEvent>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            url: url.into(),
            ack_timeout: Duration::from_secs(5),
            socket: Mutex::new(Socket::default()),
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_frame(&self, frame: &RelayFrame) -> Result<(), ConnectionError> {
        let encoded = frame
            .encode()
            .map_err(|e| ConnectionError::Unreachable(e.to_string()))?;
        let outgoing = self
            .socket
            .lock()
            .await
            .outgoing
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        outgoing
            .send(encoded)
            .await
            .map_err(|_| ConnectionError::NotConnected)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, inbound: mpsc::Sender<Inbound>) -> Result<(), ConnectionError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Unreachable(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let mut socket = self.socket.lock().await;
        if let Some(old) = socket.reader.take() {
            socket.closing.store(true, Ordering::SeqCst);
            old.abort();
        }
        let closing = Arc::new(AtomicBool::new(false));
        socket.closing = closing.clone();

        // Writer task: forward outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        socket.outgoing = Some(out_tx);
        socket.writer = Some(tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));

        // Reader task: route deliveries and acks
        let events = self.events.clone();
        let pending = self.pending_acks.clone();
        socket.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match RelayFrame::decode(&data) {
                        Ok(RelayFrame::Publish { topic, payload }) => {
                            if inbound.send(Inbound { topic, payload }).await.is_err() {
                                break;
                            }
                        }
                        Ok(RelayFrame::Subscribed { topic }) => {
                            if let Some(waiters) = pending.lock().await.remove(&topic) {
                                for waiter in waiters {
                                    let _ = waiter.send(());
                                }
                            }
                        }
                        Ok(other) => log::debug!("Ignoring unexpected relay frame {other:?}"),
                        Err(e) => log::warn!("Undecodable relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("WebSocket read error: {e}");
                        if !closing.load(Ordering::SeqCst) {
                            let _ = events.send(TransportEvent::Error(e.to_string()));
                        }
                        break;
                    }
                }
            }

            if !closing.load(Ordering::SeqCst) {
                log::info!("Relay connection lost");
                let _ = events.send(TransportEvent::Disconnected);
            }
        }));

        log::info!("Connected to relay at {}", self.url);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut socket = self.socket.lock().await;
        socket.closing.store(true, Ordering::SeqCst);
        // Dropping the sender lets the writer close the socket cleanly
        socket.outgoing = None;
        if let Some(reader) = socket.reader.take() {
            reader.abort();
        }
        socket.writer = None;
        self.pending_acks.lock().await.clear();
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(ack_tx);

        let sent = self
            .send_frame(&RelayFrame::Subscribe {
                topic: topic.to_string(),
            })
            .await;
        if let Err(e) = sent {
            self.pending_acks.lock().await.remove(topic);
            return Err(e);
        }

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::NotConnected),
            Err(_) => Err(ConnectionError::Timeout(format!("subscription to {topic}"))),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.send_frame(&RelayFrame::Unsubscribe {
            topic: topic.to_string(),
        })
        .await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.send_frame(&RelayFrame::Publish {
            topic: topic.to_string(),
            payload,
        })
        .await
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
