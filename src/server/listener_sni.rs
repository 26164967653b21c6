//! Outside-connection dispatcher
//!
//! For every TCP connection on the public port: buffer the start of the
//! TLS stream, extract the SNI hostname, look up the owning peer, open a
//! channel on its tunnel and splice bytes both ways until either side
//! closes. Failures drop the single connection; accepting continues.

use super::PeerManager;
use crate::multiplexer::{ChannelReader, ChannelWriter};
use crate::sni::{parse_client_hello_sni, ParseSniError, MAX_HELLO_READ};
use crate::throttle::TokenBucket;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Deadline for the ClientHello to arrive
const SNI_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Accepts public TLS connections and routes them by SNI
pub struct SniProxy {
    manager: Arc<PeerManager>,
}

impl SniProxy {
    pub fn new(manager: Arc<PeerManager>) -> Self {
        Self { manager }
    }

    /// Accept outside connections forever
    pub async fn run(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let manager = Arc::clone(&self.manager);
                    tokio::spawn(async move {
                        if let Err(err) = handle_outside(stream, manager).await {
                            debug!("Connection from {} dropped: {}", peer_addr, err);
                        }
                    });
                }
                Err(err) => {
                    warn!("SNI accept error: {}", err);
                }
            }
        }
    }
}

/// Route one outside connection into the owning peer's tunnel
async fn handle_outside(mut stream: TcpStream, manager: Arc<PeerManager>) -> crate::Result<()> {
    stream.set_nodelay(true).ok();

    let (hello, hostname) = read_client_hello(&mut stream).await?;
    let hostname = hostname.to_ascii_lowercase();

    let peer = match manager.get_by_hostname(&hostname) {
        Some(peer) => peer,
        None => {
            debug!(%hostname, "No peer for hostname");
            return Ok(());
        }
    };

    let channel = peer.open_channel(&hostname).await?;
    debug!(%hostname, channel = %channel.id(), "Dispatching connection");

    let throttle = peer.throttling().map(TokenBucket::new);
    let (channel_reader, mut channel_writer) = channel.split();

    // The buffered TLS bytes are the first DATA on the channel
    channel_writer.write(&hello).await?;

    let (sock_read, sock_write) = stream.into_split();
    splice(channel_reader, channel_writer, sock_read, sock_write, throttle).await;
    Ok(())
}

/// Bidirectional copy between an outside socket and a peer channel.
/// Either direction ending cancels the other.
async fn splice(
    mut channel_reader: ChannelReader,
    mut channel_writer: ChannelWriter,
    mut sock_read: OwnedReadHalf,
    mut sock_write: OwnedWriteHalf,
    mut throttle: Option<TokenBucket>,
) {
    let mut into_tunnel = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match sock_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let Some(bucket) = throttle.as_mut() {
                bucket.throttle(n).await;
            }
            if channel_writer.write(&buf[..n]).await.is_err() {
                break;
            }
        }
        channel_writer.close().await;
    });

    let mut out_of_tunnel = tokio::spawn(async move {
        while let Some(chunk) = channel_reader.read().await {
            if sock_write.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = sock_write.shutdown().await;
    });

    tokio::select! {
        _ = &mut into_tunnel => out_of_tunnel.abort(),
        _ = &mut out_of_tunnel => into_tunnel.abort(),
    }
}

/// Buffer the start of the TLS stream until the SNI hostname is known
async fn read_client_hello(stream: &mut TcpStream) -> crate::Result<(Vec<u8>, String)> {
    let mut buf = Vec::with_capacity(MAX_HELLO_READ);

    let hostname = tokio::time::timeout(SNI_READ_TIMEOUT, async {
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(crate::Error::Sni(ParseSniError::Malformed));
            }
            buf.extend_from_slice(&chunk[..n]);

            match parse_client_hello_sni(&buf) {
                Ok(Some(hostname)) => return Ok(hostname),
                Ok(None) if buf.len() >= MAX_HELLO_READ => {
                    return Err(crate::Error::Sni(ParseSniError::Malformed));
                }
                Ok(None) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    })
    .await
    .map_err(|_| {
        crate::Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out waiting for ClientHello",
        ))
    })??;

    Ok((buf, hostname))
}
