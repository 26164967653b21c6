//! Client worker
//!
//! Maintains the tunnel to the server: outbound handshake, accepting
//! channels and bridging each to the local backend, keepalive pings, and
//! reconnect with exponential backoff when the tunnel dies.

use crate::config::ClientConfig;
use crate::crypto::{
    decode_key_material, random_array32, unix_now, TokenIssuer, TokenPayload,
};
use crate::multiplexer::{Channel, Multiplexer};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// First reconnect delay
const RECONNECT_MIN: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Deadline for TCP connects (server and local backend)
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs one client's side of the tunnel
pub struct ClientWorker {
    server_addr: String,
    local_endpoint: String,
    issuer: TokenIssuer,
    identity: [u8; 32],
    hostnames: Vec<String>,
    aes_key: [u8; 32],
    aes_iv: [u8; 16],
    keepalive: Duration,
    token_ttl: u64,
}

impl ClientWorker {
    /// Build a worker from configuration, decoding the base64 key material
    pub fn from_config(config: &ClientConfig) -> crate::Result<Self> {
        if config.hostnames.is_empty() {
            return Err(crate::Error::Config("no hostnames configured".into()));
        }

        let issuer = TokenIssuer::new(&config.fernet_key)?;

        let mut identity = [0u8; 32];
        identity.copy_from_slice(&decode_key_material(&config.identity, 32)?);
        let mut aes_key = [0u8; 32];
        aes_key.copy_from_slice(&decode_key_material(&config.aes_key, 32)?);
        let mut aes_iv = [0u8; 16];
        aes_iv.copy_from_slice(&decode_key_material(&config.aes_iv, 16)?);

        Ok(Self {
            server_addr: config.server.clone(),
            local_endpoint: config.local_endpoint.clone(),
            issuer,
            identity,
            hostnames: config.hostnames.clone(),
            aes_key,
            aes_iv,
            keepalive: Duration::from_secs(config.keepalive_secs.max(1)),
            token_ttl: config.token_ttl_secs.max(1),
        })
    }

    /// Keep the tunnel alive forever, reconnecting with backoff
    pub async fn run(&self) {
        let mut backoff = RECONNECT_MIN;
        loop {
            match self.run_session().await {
                Ok(()) => {
                    info!("Tunnel closed");
                    backoff = RECONNECT_MIN;
                }
                Err(err) => {
                    warn!("Tunnel failed: {}", err);
                }
            }

            debug!("Reconnecting in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    /// Connect, handshake and serve channels until the tunnel dies
    pub async fn run_session(&self) -> crate::Result<()> {
        let mut stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect(&self.server_addr),
        )
        .await
        .map_err(|_| {
            crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "server connect timed out",
            ))
        })??;
        stream.set_nodelay(true)?;

        self.handshake(&mut stream).await?;
        info!(hostnames = ?self.hostnames, "Tunnel established");

        let multiplexer = Multiplexer::start(stream, &self.aes_key, &self.aes_iv)?;
        let mut keepalive = tokio::time::interval(self.keepalive);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                channel = multiplexer.wait_for_channel() => match channel {
                    Ok(channel) => {
                        let endpoint = self.local_endpoint.clone();
                        tokio::spawn(bridge(channel, endpoint));
                    }
                    Err(_) => break,
                },
                _ = keepalive.tick() => {
                    if let Err(err) = multiplexer.ping().await {
                        warn!("Keepalive failed: {}", err);
                        break;
                    }
                }
            }
        }

        multiplexer.close().await;
        Ok(())
    }

    /// Client side of the challenge/token handshake
    async fn handshake(&self, stream: &mut TcpStream) -> crate::Result<()> {
        stream.write_all(&random_array32()).await?;

        let mut challenge = [0u8; 32];
        stream.read_exact(&mut challenge).await?;

        let payload = TokenPayload {
            challenge,
            identity: self.identity,
            valid_until: unix_now() + self.token_ttl,
            hostnames: self.hostnames.clone(),
            aes_key: self.aes_key,
            aes_iv: self.aes_iv,
        };
        let token = self.issuer.mint(&payload);

        stream
            .write_all(&(token.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(token.as_bytes()).await?;
        Ok(())
    }
}

/// Splice one accepted channel to the local backend. Either side ending
/// cancels the other direction.
async fn bridge(channel: Channel, endpoint: String) {
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&endpoint)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!("Backend {} refused: {}", endpoint, err);
            let mut channel = channel;
            channel.close().await;
            return;
        }
        Err(_) => {
            warn!("Backend {} connect timed out", endpoint);
            let mut channel = channel;
            channel.close().await;
            return;
        }
    };
    stream.set_nodelay(true).ok();
    debug!(channel = %channel.id(), "Bridging channel to {}", endpoint);

    let (mut channel_reader, mut channel_writer) = channel.split();
    let (mut sock_read, mut sock_write) = stream.into_split();

    let mut to_backend = tokio::spawn(async move {
        while let Some(chunk) = channel_reader.read().await {
            if sock_write.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = sock_write.shutdown().await;
    });

    let mut to_tunnel = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match sock_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if channel_writer.write(&buf[..n]).await.is_err() {
                break;
            }
        }
        channel_writer.close().await;
    });

    tokio::select! {
        _ = &mut to_backend => to_tunnel.abort(),
        _ = &mut to_tunnel => to_backend.abort(),
    }
}
