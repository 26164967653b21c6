//! Multiplexing layer - many logical channels over one encrypted transport
//!
//! Provides:
//! - Frame encoding/decoding (AES-CBC encrypted headers and payloads)
//! - Channel abstraction with windowed flow control
//! - Multiplexer core: demux, ping/keepalive, orderly shutdown

mod channel;
mod core;
mod frame;

pub use channel::{Channel, ChannelReader, ChannelWriter};
pub use core::Multiplexer;
pub use frame::{ChannelId, Frame, FrameHeader, FrameType, EXTRA_LEN, HEADER_LEN};

use std::time::Duration;
use thiserror::Error;

/// Maximum frame payload size (4 MiB)
pub const MAX_FRAME: usize = 4 * 1024 * 1024;

/// Maximum DATA fragment emitted by a channel (4 KiB)
pub const MAX_DATA: usize = 4096;

/// Incoming queue level that triggers a PAUSE frame (2 MiB)
pub const INCOMING_HIGH_WATER: usize = 2 * 1024 * 1024;

/// Incoming queue level that triggers a RESUME frame (200 KiB)
pub const INCOMING_LOW_WATER: usize = 200 * 1024;

/// Per-channel cap on bytes sitting in the outgoing FIFO (64 KiB)
pub const OUTGOING_SOFT_CAP: usize = 64 * 1024;

/// Deadline for draining queued frames during shutdown
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Default deadline for a PING echo
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame-level invariant violations; fatal to the peer session
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("Frame too large: {0} > {MAX_FRAME}")]
    FrameTooLarge(usize),

    #[error("NEW frame reuses live channel {0}")]
    DuplicateChannel(ChannelId),

    #[error("Malformed {0:?} frame")]
    MalformedFrame(FrameType),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Multiplexer layer errors
#[derive(Debug, Error)]
pub enum MultiplexerError {
    #[error("Transport closed")]
    TransportClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Ping timeout")]
    PingTimeout,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
