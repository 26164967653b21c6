//! Tunnel listener
//!
//! Accepts client tunnel connections, runs the handshake under its
//! deadline, registers the peer and watches the session until it dies.

use super::handshake::{server_handshake, HANDSHAKE_TIMEOUT};
use super::{AuthenticationError, Peer, PeerManager};
use crate::crypto::TokenVerifier;
use crate::multiplexer::Multiplexer;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// How often the watchdog pings a peer and re-checks token expiry
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Accepts and supervises tunnel sessions
pub struct PeerListener {
    manager: Arc<PeerManager>,
    verifier: Arc<TokenVerifier>,
    /// Byte-rate limit applied to every peer's dispatched traffic
    throttling: Option<u64>,
}

impl PeerListener {
    pub fn new(
        manager: Arc<PeerManager>,
        verifier: Arc<TokenVerifier>,
        throttling: Option<u64>,
    ) -> Self {
        Self {
            manager,
            verifier,
            throttling,
        }
    }

    /// Accept tunnel connections forever
    pub async fn run(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("Tunnel connection from {}", peer_addr);
                    let manager = Arc::clone(&self.manager);
                    let verifier = Arc::clone(&self.verifier);
                    let throttling = self.throttling;
                    tokio::spawn(async move {
                        if let Err(err) =
                            handle_tunnel(stream, manager, verifier, throttling).await
                        {
                            debug!("Tunnel from {} rejected: {}", peer_addr, err);
                        }
                    });
                }
                Err(err) => {
                    warn!("Tunnel accept error: {}", err);
                }
            }
        }
    }
}

/// Drive one tunnel session from handshake to deregistration
async fn handle_tunnel(
    mut stream: TcpStream,
    manager: Arc<PeerManager>,
    verifier: Arc<TokenVerifier>,
    throttling: Option<u64>,
) -> crate::Result<()> {
    stream.set_nodelay(true)?;

    // No reply on failure; the socket just goes away
    let payload = tokio::time::timeout(HANDSHAKE_TIMEOUT, server_handshake(&mut stream, &verifier))
        .await
        .map_err(|_| AuthenticationError::Timeout)??;

    let multiplexer = Multiplexer::start(stream, &payload.aes_key, &payload.aes_iv)?;
    let peer = Arc::new(Peer::new(&payload, multiplexer, throttling));

    manager.register(Arc::clone(&peer)).await;
    watch_peer(&peer).await;

    manager.remove(&peer);
    peer.close().await;
    info!(hostnames = ?peer.hostnames(), "Peer disconnected");
    Ok(())
}

/// Block until the peer dies: transport loss, ping timeout or token expiry
async fn watch_peer(peer: &Peer) {
    let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = peer.wait_closed() => {
                debug!(hostnames = ?peer.hostnames(), "Peer transport closed");
                return;
            }
            _ = interval.tick() => {
                if !peer.is_valid() {
                    info!(hostnames = ?peer.hostnames(), "Peer token expired");
                    return;
                }
                if let Err(err) = peer.ping().await {
                    info!(hostnames = ?peer.hostnames(), "Peer keepalive failed: {}", err);
                    return;
                }
            }
        }
    }
}
