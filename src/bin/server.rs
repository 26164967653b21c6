//! SniTun Server
//!
//! Public edge of the tunnel:
//! - Accepts client tunnels and validates their handshake tokens
//! - Extracts SNI from outside TLS connections
//! - Dispatches each connection into the owning peer's tunnel

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use fernet::Fernet;
use snitun::config::Config;
use snitun::crypto::TokenVerifier;
use snitun::server::{HealthEndpoint, PeerListener, PeerManager, SniProxy};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// SniTun Server - SNI-aware tunnel edge
#[derive(Parser, Debug)]
#[command(name = "snitun-server")]
#[command(about = "SniTun Server - expose NAT-bound TLS services by SNI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Tunnel-accept listen address (overrides config)
    #[arg(long)]
    tunnel_listen: Option<String>,

    /// Public SNI listen address (overrides config)
    #[arg(long)]
    sni_listen: Option<String>,

    /// Generate a new Fernet key and exit
    #[arg(long)]
    generate_fernet_key: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    if args.generate_fernet_key {
        println!("{}", Fernet::generate_key());
        println!();
        println!("Add to your server config.toml:");
        println!("  fernet_keys = [\"<key>\"]");
        println!("Share the key with the client it belongs to.");
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let server_config = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    if server_config.fernet_keys.is_empty() {
        return Err(anyhow!(
            "No fernet_keys configured - every handshake would be rejected"
        ));
    }

    let verifier = Arc::new(
        TokenVerifier::new(&server_config.fernet_keys).context("Invalid fernet key")?,
    );
    let manager = Arc::new(PeerManager::new());

    let tunnel_addr = args.tunnel_listen.unwrap_or(server_config.tunnel_listen);
    let sni_addr = args.sni_listen.unwrap_or(server_config.sni_listen);

    let tunnel_listener = TcpListener::bind(&tunnel_addr)
        .await
        .context("Failed to bind tunnel listener")?;
    let sni_listener = TcpListener::bind(&sni_addr)
        .await
        .context("Failed to bind SNI listener")?;

    info!("SniTun Server v{}", snitun::VERSION);
    info!("Tunnel endpoint on {}", tunnel_addr);
    info!("SNI endpoint on {}", sni_addr);

    let peer_listener = PeerListener::new(
        Arc::clone(&manager),
        verifier,
        server_config.throttling,
    );
    let sni_proxy = SniProxy::new(Arc::clone(&manager));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(async move {
        peer_listener.run(tunnel_listener).await;
    }));
    tasks.push(tokio::spawn(async move {
        sni_proxy.run(sni_listener).await;
    }));

    if let Some(health_addr) = server_config.health_listen {
        let health_listener = TcpListener::bind(&health_addr)
            .await
            .context("Failed to bind health listener")?;
        info!("Health endpoint on {}", health_addr);
        let health = HealthEndpoint::new(Arc::clone(&manager));
        tasks.push(tokio::spawn(async move {
            health.run(health_listener).await;
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    for task in tasks {
        task.abort();
    }

    Ok(())
}
