//! Frame encoding/decoding for the tunnel protocol
//!
//! Wire format, all integers big-endian:
//! ```text
//! +----------------------------------+
//! |  Header ciphertext (32 bytes)    |   AES-CBC, no padding
//! |   channel id (16B)               |
//! |   frame type (1B)                |
//! |   payload length L (4B)          |
//! |   extra (11B)                    |
//! +----------------------------------+
//! |  Payload ciphertext              |   AES-CBC, PKCS#7
//! |   (L/16 + 1) * 16 bytes,         |
//! |   absent when L == 0             |
//! +----------------------------------+
//! ```

use super::{ProtocolError, MAX_FRAME};
use crate::crypto::{pkcs7_pad, pkcs7_unpad, random_bytes, FrameDecryptor, FrameEncryptor};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the encrypted frame header in bytes
pub const HEADER_LEN: usize = 32;

/// Size of the type-dependent extra field in bytes
pub const EXTRA_LEN: usize = 11;

/// Longest hostname a NEW frame may carry
pub const MAX_HOSTNAME_LEN: usize = 255;

/// 16-byte channel identifier, random and unique per channel within a session
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId([u8; 16]);

impl ChannelId {
    /// Identifier used by session-level frames (PING)
    pub const ZERO: ChannelId = ChannelId([0u8; 16]);

    /// Generate a fresh random identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        random_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({self})")
    }
}

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a channel; payload carries the hostname
    New = 0x01,
    /// Opaque TCP bytes for a channel
    Data = 0x02,
    /// Half-close a channel from the sender's side
    Close = 0x04,
    /// Liveness probe; extra holds the echo tag
    Ping = 0x08,
    /// Ask the remote to stop writing on a channel
    Pause = 0x16,
    /// Ask the remote to resume writing on a channel
    Resume = 0x17,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::New),
            0x02 => Ok(FrameType::Data),
            0x04 => Ok(FrameType::Close),
            0x08 => Ok(FrameType::Ping),
            0x16 => Ok(FrameType::Pause),
            0x17 => Ok(FrameType::Resume),
            _ => Err(ProtocolError::UnknownFrameType(value)),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub channel: ChannelId,
    pub frame_type: FrameType,
    pub extra: [u8; EXTRA_LEN],
    pub payload: Bytes,
}

impl Frame {
    /// Create a NEW frame opening `channel` for `hostname`
    pub fn new_channel(channel: ChannelId, hostname: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + hostname.len());
        payload.put_u16(hostname.len() as u16);
        payload.put_slice(hostname.as_bytes());
        Self {
            channel,
            frame_type: FrameType::New,
            extra: [0u8; EXTRA_LEN],
            payload: payload.freeze(),
        }
    }

    /// Create a DATA frame
    pub fn data(channel: ChannelId, payload: Bytes) -> Self {
        Self {
            channel,
            frame_type: FrameType::Data,
            extra: [0u8; EXTRA_LEN],
            payload,
        }
    }

    /// Create a CLOSE frame
    pub fn close(channel: ChannelId) -> Self {
        Self {
            channel,
            frame_type: FrameType::Close,
            extra: [0u8; EXTRA_LEN],
            payload: Bytes::new(),
        }
    }

    /// Create a PING request with a random tag; returns the frame and the
    /// 10-byte token a matching echo will carry
    pub fn ping_request() -> (Self, [u8; EXTRA_LEN - 1]) {
        let mut token = [0u8; EXTRA_LEN - 1];
        random_bytes(&mut token);
        let mut extra = [0u8; EXTRA_LEN];
        extra[1..].copy_from_slice(&token);
        let frame = Self {
            channel: ChannelId::ZERO,
            frame_type: FrameType::Ping,
            extra,
            payload: Bytes::new(),
        };
        (frame, token)
    }

    /// Create the echo for a received PING request
    pub fn ping_reply(request_extra: &[u8; EXTRA_LEN]) -> Self {
        let mut extra = *request_extra;
        extra[0] = 1;
        Self {
            channel: ChannelId::ZERO,
            frame_type: FrameType::Ping,
            extra,
            payload: Bytes::new(),
        }
    }

    /// Create a PAUSE frame
    pub fn pause(channel: ChannelId) -> Self {
        Self {
            channel,
            frame_type: FrameType::Pause,
            extra: [0u8; EXTRA_LEN],
            payload: Bytes::new(),
        }
    }

    /// Create a RESUME frame
    pub fn resume(channel: ChannelId) -> Self {
        Self {
            channel,
            frame_type: FrameType::Resume,
            extra: [0u8; EXTRA_LEN],
            payload: Bytes::new(),
        }
    }

    /// Hostname carried by a NEW frame
    pub fn hostname(&self) -> Result<String, ProtocolError> {
        let mut buf = &self.payload[..];
        if buf.remaining() < 2 {
            return Err(ProtocolError::MalformedFrame(FrameType::New));
        }
        let len = buf.get_u16() as usize;
        if len == 0 || len > MAX_HOSTNAME_LEN || buf.remaining() != len {
            return Err(ProtocolError::MalformedFrame(FrameType::New));
        }
        std::str::from_utf8(buf)
            .map(str::to_string)
            .map_err(|_| ProtocolError::MalformedFrame(FrameType::New))
    }

    /// Encrypt this frame into its wire representation
    pub fn encode(&self, crypto: &mut FrameEncryptor) -> Result<BytesMut, ProtocolError> {
        if self.payload.len() > MAX_FRAME {
            return Err(ProtocolError::FrameTooLarge(self.payload.len()));
        }

        let mut header = [0u8; HEADER_LEN];
        header[..16].copy_from_slice(self.channel.as_bytes());
        header[16] = self.frame_type as u8;
        header[17..21].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        header[21..].copy_from_slice(&self.extra);
        crypto.encrypt(&mut header)?;

        let mut wire = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + 16);
        wire.put_slice(&header);

        if !self.payload.is_empty() {
            let mut body = self.payload.to_vec();
            pkcs7_pad(&mut body);
            crypto.encrypt(&mut body)?;
            wire.put_slice(&body);
        }

        Ok(wire)
    }

    /// Decrypt and parse a header buffer read off the wire
    pub fn decode_header(
        crypto: &mut FrameDecryptor,
        header: &mut [u8; HEADER_LEN],
    ) -> Result<FrameHeader, ProtocolError> {
        crypto.decrypt(header)?;

        let mut id = [0u8; 16];
        id.copy_from_slice(&header[..16]);
        let frame_type = FrameType::try_from(header[16])?;
        let payload_len = u32::from_be_bytes([header[17], header[18], header[19], header[20]]) as usize;
        if payload_len > MAX_FRAME {
            return Err(ProtocolError::FrameTooLarge(payload_len));
        }
        let mut extra = [0u8; EXTRA_LEN];
        extra.copy_from_slice(&header[21..]);

        Ok(FrameHeader {
            channel: ChannelId::from_bytes(id),
            frame_type,
            payload_len,
            extra,
        })
    }

    /// Decrypt a payload ciphertext for a previously decoded header
    pub fn decode_payload(
        crypto: &mut FrameDecryptor,
        header: FrameHeader,
        mut ciphertext: Vec<u8>,
    ) -> Result<Frame, ProtocolError> {
        let payload = if header.payload_len == 0 {
            Bytes::new()
        } else {
            crypto.decrypt(&mut ciphertext)?;
            let unpadded = pkcs7_unpad(&ciphertext)?;
            if unpadded != header.payload_len {
                return Err(ProtocolError::MalformedFrame(header.frame_type));
            }
            ciphertext.truncate(unpadded);
            Bytes::from(ciphertext)
        };

        Ok(Frame {
            channel: header.channel,
            frame_type: header.frame_type,
            extra: header.extra,
            payload,
        })
    }
}

/// A decoded frame header, before its payload has been read
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub channel: ChannelId,
    pub frame_type: FrameType,
    pub payload_len: usize,
    pub extra: [u8; EXTRA_LEN],
}
