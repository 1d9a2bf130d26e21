//! Tierlink Signal Server
//!
//! WebSocket relay over a signaling store.
//!
//! # Usage
//!
//! ```bash
//! # In-memory mode (default)
//! tierlink-signal --port 8787
//!
//! # With SQLite persistence
//! tierlink-signal --port 8787 --db /var/lib/tierlink/signal.db
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierlink_core::Config;
use tierlink_signal::{MemoryStore, RelayServer, SignalingStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "tierlink-signal")]
#[command(about = "Tierlink signaling relay for room discovery")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "TIERLINK_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// SQLite database path for persistence (optional, uses in-memory if not specified)
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Longest room lifetime in seconds
    #[arg(long)]
    ttl: Option<u64>,

    /// Expiry sweep interval in seconds
    #[arg(long)]
    sweep_secs: Option<u64>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let signal = config.signal;

    let port = args.port.unwrap_or(signal.port);
    let bind = args.bind.unwrap_or_else(|| signal.bind.to_string());
    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    let sweep = Duration::from_secs(args.sweep_secs.unwrap_or(signal.sweep_interval_secs));
    let ttl = Duration::from_secs(args.ttl.unwrap_or(signal.room_ttl_secs));

    info!("Starting Tierlink Signal Server");
    info!("Listening on {}, rooms live at most {:?}", addr, ttl);

    let store: Arc<dyn SignalingStore> = match args.db.or(signal.db_path) {
        Some(db_path) => {
            // Create parent directory if it doesn't exist
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!("Using SQLite persistence: {:?}", db_path);
            let store = SqliteStore::open(&db_path)?;
            info!("Loaded {} rooms from database", store.room_count().await.unwrap_or(0));
            Arc::new(store)
        }
        None => {
            info!("Using in-memory storage (no persistence)");
            Arc::new(MemoryStore::new())
        }
    };

    let server = RelayServer::new(store)
        .with_join_limit(config.limits.joins())
        .with_sweep_interval(sweep)
        .with_max_ttl(ttl);
    server.serve(addr).await?;

    Ok(())
}
