//! quicnet-node — demonstration binary wiring a `quicnet_core::Node` onto a
//! UDP socket: load or generate a keypair, register a couple of stock
//! handlers, dial any configured seeds, and run the event loop until
//! ctrl-c.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use quicnet_core::config::NodeConfig;
use quicnet_core::crypto::Keypair;
use quicnet_core::message::{Handler, HandlerRegistry, ProtocolCode};
use quicnet_core::Node;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "quicnet-node", version, about = "quicnet-core demonstration node")]
struct Args {
    /// Address to bind the UDP socket to.
    #[arg(long, default_value = "0.0.0.0:30303")]
    listen_addr: SocketAddr,

    /// Directory holding the node's keypair and ban list.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Seed peer, as a multiaddress (`/ip4/.../udp/.../p2p/...`). Repeatable.
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Tracing filter directive, e.g. "info" or "quicnet_core=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

const KEYPAIR_FILE: &str = "node_key";
const BAN_LIST_FILE: &str = "ban_list";

fn load_or_generate_keypair(data_dir: &std::path::Path) -> Result<Keypair> {
    let path = data_dir.join(KEYPAIR_FILE);
    if let Ok(bytes) = std::fs::read(&path) {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("keypair file at {} is not 32 bytes", path.display()))?;
        return Ok(Keypair::from_secret_bytes(&secret));
    }
    let keypair = Keypair::generate();
    std::fs::write(&path, keypair.secret_bytes()).context("writing new keypair file")?;
    Ok(keypair)
}

fn build_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry
        .register(
            ProtocolCode::TextV1,
            Handler::Result(Arc::new(|message| {
                info!(bytes = message.payload.len(), "received TEXT_V1 request");
                b"ok".to_vec()
            })),
        )
        .expect("TextV1 declares a response, Result handler matches");
    registry
        .register(
            ProtocolCode::HeartbeatV1,
            Handler::Void(Arc::new(|_message| {})),
        )
        .expect("HeartbeatV1 is void, Void handler matches");
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data dir {}", args.data_dir.display()))?;
    let keypair = load_or_generate_keypair(&args.data_dir)?;
    info!(node_id = %hex::encode(keypair.public_key()), "node identity loaded");

    let config = NodeConfig {
        listen_addr: args.listen_addr,
        data_dir: args.data_dir.clone(),
        seeds: args.seeds.clone(),
        ..NodeConfig::default()
    };

    let registry = build_registry();
    let node = Arc::new(
        Node::bind(config, keypair, registry)
            .await
            .context("binding UDP socket")?,
    );

    let ban_path = node.config.data_dir.join(BAN_LIST_FILE);
    if node.connections.bans.load_into(&ban_path).is_ok() {
        info!("loaded ban list from {}", ban_path.display());
    }

    for seed in &args.seeds {
        match quicnet_core::addr::Multiaddr::parse(seed) {
            Ok(multiaddr) => {
                let node = node.clone();
                let addr = multiaddr.socket_addr();
                tokio::spawn(async move {
                    match node.connect(addr).await {
                        Ok(connection_id) => info!(%addr, connection_id, "connected to seed"),
                        Err(e) => warn!(%addr, error = %e, "failed to connect to seed"),
                    }
                });
            }
            Err(e) => error!(seed, error = %e, "invalid seed multiaddress, skipping"),
        }
    }

    info!(listen_addr = %args.listen_addr, "quicnet-node listening");

    let run_node = node.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = run_node.run().await {
            error!(error = %e, "event loop exited");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    handle.abort();
    Ok(())
}
