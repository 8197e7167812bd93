//! Mindweave sync server binary.
//!
//! Runs the WebSocket sync server and, when `--http-addr` is given, the
//! batch sync / sharing HTTP API on the same hub.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;

use mindweave_sync::{http, ServerConfig, SyncServer};

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "mindweave-server")]
#[command(about = "Collaborative document sync server")]
struct Args {
    /// WebSocket address to bind
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// HTTP API address (disabled when omitted)
    #[arg(long, value_name = "ADDR")]
    http_addr: Option<String>,

    /// RocksDB directory (in-memory when omitted)
    #[arg(long, value_name = "PATH")]
    storage: Option<PathBuf>,

    /// Per-member channel buffer, in events
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// Seconds between heartbeat pings
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Unanswered pings before a session is closed
    #[arg(long, default_value_t = 3)]
    max_missed_heartbeats: u32,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            max_missed_heartbeats: self.max_missed_heartbeats.max(1),
            storage_path: self.storage,
            http_addr: self.http_addr,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Args::parse().into_config();
    info!("Starting mindweave-server...");

    let server = SyncServer::new(config)?;
    if let Some(addr) = server.config().http_addr.clone() {
        let hub = server.hub().clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(&addr, hub).await {
                log::error!("HTTP API stopped: {e}");
            }
        });
    }

    server.run().await?;
    Ok(())
}
