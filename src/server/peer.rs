//! A peer is one authenticated tunnel session

use crate::crypto::{unix_now, TokenPayload};
use crate::multiplexer::{Channel, Multiplexer, MultiplexerError};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// An authenticated client session owning a tunnel and a set of hostnames
pub struct Peer {
    identity: [u8; 32],
    hostnames: Vec<String>,
    valid_until: u64,
    throttling: Option<u64>,
    multiplexer: Multiplexer,
    last_activity: Mutex<Instant>,
}

impl Peer {
    /// Build a peer from a validated handshake token and its running tunnel
    pub fn new(payload: &TokenPayload, multiplexer: Multiplexer, throttling: Option<u64>) -> Self {
        Self {
            identity: payload.identity,
            hostnames: payload.hostnames.clone(),
            valid_until: payload.valid_until,
            throttling,
            multiplexer,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn identity(&self) -> &[u8; 32] {
        &self.identity
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    /// Byte-rate limit for dispatched connections, if any
    pub fn throttling(&self) -> Option<u64> {
        self.throttling
    }

    /// False once the handshake token's lifetime has run out
    pub fn is_valid(&self) -> bool {
        self.valid_until > unix_now()
    }

    pub fn is_connected(&self) -> bool {
        self.multiplexer.is_connected()
    }

    /// Open a channel toward the client for an outside connection
    pub async fn open_channel(&self, hostname: &str) -> Result<Channel, MultiplexerError> {
        self.touch();
        self.multiplexer.create_channel(hostname).await
    }

    /// Probe tunnel liveness
    pub async fn ping(&self) -> Result<(), MultiplexerError> {
        self.multiplexer.ping().await
    }

    /// Tear the tunnel down, closing every channel
    pub async fn close(&self) {
        self.multiplexer.close().await;
    }

    /// Resolve once the tunnel is gone, whatever the cause
    pub async fn wait_closed(&self) {
        self.multiplexer.wait_closed().await;
    }

    /// Record activity on behalf of this peer
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Time since the last dispatched connection or registration
    pub fn idle(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}
