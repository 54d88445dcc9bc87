use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use meshweave::switchboard::memory::MemorySwitchboard;
use meshweave::transport::memory::{MemoryHub, MemoryTransportFactory};
use meshweave::{Draft, Keypair, Node, NodeEvent};

/// Demo: spin up a small in-process mesh and watch it converse.
///
/// Every node runs the full stack (switchboard bootstrap, presence gossip,
/// signed messages); only the transport is in-memory.
#[derive(Parser, Debug)]
#[command(name = "meshweave")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes to start.
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Network identifier shared by all nodes.
    #[arg(long, default_value = "demo")]
    network: String,

    /// Seconds between chat broadcasts.
    #[arg(short, long, default_value = "5")]
    chat_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let switchboard = MemorySwitchboard::new();
    let hub = MemoryHub::new();

    let mut nodes = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let keypair = Keypair::generate();
        let node = Node::builder(&args.network, "memory://demo")
            .secret(keypair.to_secret_hex())
            .switchboard(switchboard.clone())
            .transport(MemoryTransportFactory::new(hub.clone()))
            .spawn()
            .await?;
        info!(node = i, address = %node.address(), "node up");

        let mut events = node.events().await?;
        let label = i;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    NodeEvent::Message(message) if message.app_id == "chat" => {
                        info!(node = label, from = %message.address, data = %message.data, "chat");
                    }
                    NodeEvent::AddConnection { address, .. } => {
                        info!(node = label, peer = %address, "connected");
                    }
                    NodeEvent::DestroyConnection { address, .. } => {
                        info!(node = label, peer = ?address.map(|a| a.to_string()), "disconnected");
                    }
                    NodeEvent::BadMessage { address, reason } => {
                        warn!(node = label, from = %address, %reason, "bad message");
                    }
                    _ => {}
                }
            }
        });

        nodes.push(node);
    }

    let mut chat = time::interval(Duration::from_secs(args.chat_interval.max(1)));
    chat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut counter = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = chat.tick() => {
                counter += 1;
                let speaker = &nodes[(counter as usize) % nodes.len()];
                let draft = Draft::new("chat", "text")
                    .data(serde_json::json!({ "body": format!("hello #{counter}") }));
                if let Err(e) = speaker.broadcast(draft).await {
                    warn!(error = %e, "broadcast failed");
                }
            }
        }
    }

    for node in &nodes {
        node.teardown().await;
    }
    Ok(())
}
