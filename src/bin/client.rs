//! SniTun Client
//!
//! Inside end of the tunnel:
//! - Connects out to the server and completes the token handshake
//! - Accepts channels and bridges each to the local backend
//! - Reconnects with exponential backoff when the tunnel drops

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;
use fernet::Fernet;
use snitun::client::ClientWorker;
use snitun::config::Config;
use snitun::crypto::{random_array32, random_bytes};
use tracing::info;

/// SniTun Client - expose a local service through the tunnel
#[derive(Parser, Debug)]
#[command(name = "snitun-client")]
#[command(about = "SniTun Client - expose a local TLS service by SNI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Server tunnel endpoint (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Generate fresh client credentials and exit
    #[arg(long)]
    generate_credentials: bool,

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

    if args.generate_credentials {
        return generate_credentials();
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    if let Some(server) = args.server {
        client_config.server = server;
    }

    let worker = ClientWorker::from_config(&client_config).context("Invalid client config")?;

    info!("SniTun Client v{}", snitun::VERSION);
    info!("Server endpoint {}", client_config.server);
    info!("Local backend {}", client_config.local_endpoint);

    tokio::select! {
        _ = worker.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

/// Print a fresh set of client credentials
fn generate_credentials() -> Result<()> {
    let mut aes_iv = [0u8; 16];
    random_bytes(&mut aes_iv);

    println!("fernet_key = \"{}\"", Fernet::generate_key());
    println!("identity = \"{}\"", STANDARD.encode(random_array32()));
    println!("aes_key = \"{}\"", STANDARD.encode(random_array32()));
    println!("aes_iv = \"{}\"", STANDARD.encode(aes_iv));
    println!();
    println!("Add these to the [client] section of config.toml and register");
    println!("the fernet_key with the server operator.");

    Ok(())
}
