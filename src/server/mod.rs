//! Server layer - accepts tunnels and dispatches outside connections
//!
//! Provides:
//! - Challenge/token handshake for incoming tunnels
//! - Peer sessions and the hostname registry
//! - The public SNI dispatcher and the optional health endpoint

mod handshake;
mod health;
mod listener_peer;
mod listener_sni;
mod peer;
mod peer_manager;

pub use handshake::{server_handshake, HANDSHAKE_TIMEOUT};
pub use health::HealthEndpoint;
pub use listener_peer::PeerListener;
pub use listener_sni::SniProxy;
pub use peer::Peer;
pub use peer_manager::PeerManager;

use thiserror::Error;

/// Handshake failures; the socket is closed without a reply so a probing
/// client cannot tell these cases apart
#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("Token invalid")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Challenge mismatch")]
    ChallengeMismatch,

    #[error("Invalid hostname {0:?}")]
    InvalidHostname(String),

    #[error("Handshake timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
