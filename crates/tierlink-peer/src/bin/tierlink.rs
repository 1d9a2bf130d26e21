//! Tierlink CLI - inspect room codes and run an in-process session pair
//!
//! Usage:
//!   tierlink decode <code>            Show the short code and embedded document URL
//!   tierlink demo [--relay <url>]     Host and join a room, exchange a delta and an image

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierlink_core::{Config, RoomCode};
use tierlink_peer::{CreateRoomOptions, MemoryNetwork, PeerSession, PeerSessionOptions, SessionEvent};
use tierlink_signal::{MemoryStore, RemoteStore, SignalingStore};

#[derive(Parser)]
#[command(name = "tierlink")]
#[command(about = "Peer-to-peer board transport", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a room code
    Decode {
        /// Short (TIER-XXXXXX) or long code
        code: String,
    },

    /// Run a host and a client in this process
    Demo {
        /// Signaling relay URL (default: in-process store)
        #[arg(short, long)]
        relay: Option<String>,

        /// Document URL to embed in the room code
        #[arg(short, long)]
        document: Option<String>,

        /// Image size to send from client to host, in bytes
        #[arg(long, default_value = "50000")]
        image_bytes: usize,
    },

    /// Print a sample configuration file
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Commands::Decode { code } => decode(&code),
        Commands::Demo {
            relay,
            document,
            image_bytes,
        } => demo(relay, document, image_bytes).await,
        Commands::Config => {
            print!("{}", Config::sample());
            Ok(())
        }
    }
}

fn decode(code: &str) -> Result<(), Box<dyn std::error::Error>> {
    let code = RoomCode::parse(code)?;
    println!("Room:     {}", code.short_code());
    match code.document_url() {
        Some(url) => println!("Document: {}", url),
        None => println!("Document: (none)"),
    }
    Ok(())
}

async fn demo(
    relay: Option<String>,
    document: Option<String>,
    image_bytes: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();
    let store: Arc<dyn SignalingStore> = match relay {
        Some(url) => {
            info!("Using signaling relay at {}", url);
            Arc::new(RemoteStore::connect(&url).await?)
        }
        None => Arc::new(MemoryStore::new()),
    };
    let network = Arc::new(MemoryNetwork::new());

    let options = |name: &str| PeerSessionOptions {
        display_name: name.to_string(),
        capabilities: vec!["sync".into(), "image".into()],
        config: config.clone(),
    };
    let host = PeerSession::new(network.clone(), store.clone(), options("host"));
    let client = PeerSession::new(network, store, options("client"));

    let mut host_events = host.subscribe();
    let mut client_events = client.subscribe();

    let code = host
        .create_room(CreateRoomOptions {
            document_url: document,
            password: None,
        })
        .await?;
    println!("Room code: {}", code);

    client.join_room(&code.to_string(), None).await?;

    let wait = config.session.connect_timeout();
    host.wait_connected(wait).await?;
    client.wait_connected(wait).await?;
    println!("Connected: host {} <-> client {}", host.local_id(), client.local_id());

    host.send_sync("demo-board", vec![1u8, 2, 3]);
    let image: Vec<u8> = (0..image_bytes).map(|i| (i % 251) as u8).collect();
    client.send_image("demo-image", image).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let (mut got_sync, mut got_image) = (false, false);
    while !(got_sync && got_image) {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Demo timed out waiting for events");
                break;
            }
            event = client_events.recv() => {
                if let Ok(SessionEvent::SyncReceived { sender_id, board_id, delta, sequence }) = event {
                    println!("Client got sync #{} for {} from {}: {:?}", sequence, board_id, sender_id, delta.as_ref());
                    got_sync = true;
                }
            }
            event = host_events.recv() => {
                if let Ok(SessionEvent::ImageReceived { sender_id, transfer_id, data }) = event {
                    println!("Host got image {} from {}: {} bytes", transfer_id, sender_id, data.len());
                    got_image = true;
                }
            }
        }
    }

    host.close_room().await?;
    client.leave_room().await;
    Ok(())
}
