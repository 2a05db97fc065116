//! Reference pub/sub relay for `WebSocketTransport` clients.
//!
//! ```text
//! QUIRE_RELAY_ADDR=0.0.0.0:9090 RUST_LOG=info quire-relay [config.json]
//! ```

use quire_collab::relay::{RelayConfig, RelayServer};

fn load_config() -> Result<RelayConfig, Box<dyn std::error::Error>> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => RelayConfig::default(),
    };
    if let Ok(addr) = std::env::var("QUIRE_RELAY_ADDR") {
        config.bind_addr = addr;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = load_config()?;
    log::info!("Starting quire relay on {}...", config.bind_addr);

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            log::info!(
                "Shutting down after {} connections, {} frames",
                stats.total_connections,
                stats.total_frames
            );
        }
    }
    Ok(())
}
