//! WebSocket pub/sub relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌──► Client A
//!            ├── Subscribe/Publish ──► TopicRegistry ──┼──► Client B
//! Client B ──┘       (bincode)          └──► Client C
//! ```
//!
//! The relay is deliberately dumb: it never decodes envelopes, keeps no
//! document state and does not filter echoes. Every subscriber of a topic,
//! including the publisher, receives each `Publish` frame verbatim.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::TopicRegistry;
use crate::protocol::RelayFrame;

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-subscriber buffer for each topic
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
}

pub struct RelayServer {
    config: RelayConfig,
    topics: Arc<TopicRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let topics = Arc::new(TopicRegistry::new(config.broadcast_capacity));
        Self {
            config,
            topics,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener (lets tests bind port 0).
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let topics = self.topics.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, topics, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        topics: Arc<TopicRegistry>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn_id = Uuid::new_v4();

        log::info!("WebSocket connection {conn_id} established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Deliveries from every subscribed topic funnel through one queue
        let (deliver_tx, mut deliver_rx) = mpsc::channel::<Arc<Vec<u8>>>(256);
        let mut forwards: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += data.len() as u64;
                            }

                            match RelayFrame::decode(&data) {
                                Ok(RelayFrame::Subscribe { topic }) => {
                                    if !forwards.contains_key(&topic) {
                                        let group = topics.get_or_create(&topic).await;
                                        let rx = group.subscribe(conn_id).await;
                                        let forward = spawn_forward(rx, group, deliver_tx.clone(), topic.clone());
                                        forwards.insert(topic.clone(), forward);
                                        log::debug!("{conn_id} subscribed to {topic}");
                                    }
                                    let ack = RelayFrame::Subscribed { topic }.encode()?;
                                    ws_sender.send(Message::Binary(ack.into())).await?;
                                }
                                Ok(RelayFrame::Unsubscribe { topic }) => {
                                    if let Some(forward) = forwards.remove(&topic) {
                                        forward.abort();
                                        if let Some(group) = topics.get(&topic).await {
                                            group.unsubscribe(&conn_id).await;
                                        }
                                        topics.remove_if_empty(&topic).await;
                                        log::debug!("{conn_id} unsubscribed from {topic}");
                                    }
                                }
                                Ok(RelayFrame::Publish { topic, .. }) => {
                                    // Forward the frame verbatim, no re-encoding
                                    if let Some(group) = topics.get(&topic).await {
                                        let receivers = group.publish(Arc::new(data.to_vec()));
                                        log::trace!("Publish on {topic} reached {receivers} subscribers");
                                    }
                                }
                                Ok(RelayFrame::Subscribed { .. }) => {
                                    log::debug!("Client {conn_id} sent a relay-only frame");
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                Some(frame) = deliver_rx.recv() => {
                    ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                }
            }
        }

        // Cleanup: drop every subscription of this connection
        for (topic, forward) in forwards.drain() {
            forward.abort();
            if let Some(group) = topics.get(&topic).await {
                group.unsubscribe(&conn_id).await;
            }
            topics.remove_if_empty(&topic).await;
        }

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        Ok(())
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.topics
    }
}

fn spawn_forward(
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    group: Arc<crate::broadcast::TopicGroup>,
    deliver: mpsc::Sender<Arc<Vec<u8>>>,
    topic: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if deliver.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Subscriber on {topic} lagged by {n} frames");
                    group.record_dropped(n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_relay_config_partial_json() {
        let config: RelayConfig = serde_json::from_str(r#"{"bind_addr":"0.0.0.0:7000"}"#).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.stats().await, RelayStats::default());
        assert_eq!(relay.topics().topic_count().await, 0);
        assert_eq!(relay.bind_addr(), "127.0.0.1:9090");
    }
}
