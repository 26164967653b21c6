//! # SniTun
//!
//! An SNI-aware TCP reverse proxy. Many NAT-bound clients expose TLS
//! services through one public edge server, each over a single persistent
//! encrypted tunnel carrying multiplexed logical channels.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Outside world (:443)                 │
//! │        TLS ClientHello → SNI hostname lookup         │
//! ├─────────────────────────────────────────────────────┤
//! │                    Server Layer                      │
//! │   (peer handshake, registry, connection dispatch)    │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplexing Layer                   │
//! │     (channels, flow control, ping, AES-CBC frames)   │
//! ├─────────────────────────────────────────────────────┤
//! │                    Client Layer                      │
//! │      (tunnel worker, bridge to local backend)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod multiplexer;
pub mod server;
pub mod sni;
pub mod throttle;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port clients connect their tunnel to
pub const DEFAULT_TUNNEL_PORT: u16 = 8080;

/// Default port outside TLS connections arrive on
pub const DEFAULT_SNI_PORT: u16 = 443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] multiplexer::ProtocolError),

    #[error("Multiplexer error: {0}")]
    Multiplexer(#[from] multiplexer::MultiplexerError),

    #[error("SNI parse error: {0}")]
    Sni(#[from] sni::ParseSniError),

    #[error("Authentication error: {0}")]
    Authentication(#[from] server::AuthenticationError),

    #[error("Configuration error: {0}")]
    Config(String),
}
