//! Fernet handshake tokens
//!
//! The handshake response is a Fernet token whose plaintext carries the
//! server challenge, the client identity, the expiry, the hostnames the
//! client claims, and the AES session material:
//!
//! ```text
//! challenge(32) | identity(32) | valid_until(8, BE unix secs)
//!   | hostname_count(1) | [len(1) | hostname]* | aes_key(32) | aes_iv(16)
//! ```

use super::{CryptoError, IV_LEN, KEY_LEN};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, BufMut, BytesMut};
use fernet::{Fernet, MultiFernet};

/// Maximum hostnames a single token may claim
pub const MAX_HOSTNAMES: usize = 16;

/// Decoded token plaintext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPayload {
    pub challenge: [u8; 32],
    pub identity: [u8; 32],
    /// Unix seconds; a token with `valid_until <= now` is rejected
    pub valid_until: u64,
    pub hostnames: Vec<String>,
    pub aes_key: [u8; KEY_LEN],
    pub aes_iv: [u8; IV_LEN],
}

impl TokenPayload {
    /// Serialize to the binary layout carried inside the Fernet envelope
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(&self.challenge);
        buf.put_slice(&self.identity);
        buf.put_u64(self.valid_until);
        buf.put_u8(self.hostnames.len() as u8);
        for hostname in &self.hostnames {
            buf.put_u8(hostname.len() as u8);
            buf.put_slice(hostname.as_bytes());
        }
        buf.put_slice(&self.aes_key);
        buf.put_slice(&self.aes_iv);
        buf.to_vec()
    }

    /// Parse the binary layout; trailing garbage is rejected
    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        let mut buf = data;

        if buf.remaining() < 32 + 32 + 8 + 1 {
            return Err(CryptoError::MalformedToken);
        }

        let mut challenge = [0u8; 32];
        buf.copy_to_slice(&mut challenge);
        let mut identity = [0u8; 32];
        buf.copy_to_slice(&mut identity);
        let valid_until = buf.get_u64();

        let count = buf.get_u8() as usize;
        if count == 0 || count > MAX_HOSTNAMES {
            return Err(CryptoError::MalformedToken);
        }

        let mut hostnames = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 1 {
                return Err(CryptoError::MalformedToken);
            }
            let len = buf.get_u8() as usize;
            if len == 0 || buf.remaining() < len {
                return Err(CryptoError::MalformedToken);
            }
            let name = std::str::from_utf8(&buf[..len])
                .map_err(|_| CryptoError::MalformedToken)?
                .to_string();
            buf.advance(len);
            hostnames.push(name);
        }

        if buf.remaining() != KEY_LEN + IV_LEN {
            return Err(CryptoError::MalformedToken);
        }
        let mut aes_key = [0u8; KEY_LEN];
        buf.copy_to_slice(&mut aes_key);
        let mut aes_iv = [0u8; IV_LEN];
        buf.copy_to_slice(&mut aes_iv);

        Ok(Self {
            challenge,
            identity,
            valid_until,
            hostnames,
            aes_key,
            aes_iv,
        })
    }
}

/// Mints handshake tokens with a single pre-shared Fernet key (client side)
pub struct TokenIssuer {
    fernet: Fernet,
}

impl TokenIssuer {
    pub fn new(key: &str) -> Result<Self, CryptoError> {
        let fernet = Fernet::new(key)
            .ok_or_else(|| CryptoError::InvalidFernetKey("bad key encoding".into()))?;
        Ok(Self { fernet })
    }

    /// Produce a fresh URL-safe token string
    pub fn mint(&self, payload: &TokenPayload) -> String {
        self.fernet.encrypt(&payload.encode())
    }
}

/// Verifies handshake tokens against a ring of pre-shared keys (server side)
pub struct TokenVerifier {
    fernet: MultiFernet,
}

impl TokenVerifier {
    pub fn new(keys: &[String]) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::InvalidFernetKey("no keys configured".into()));
        }
        let fernets = keys
            .iter()
            .map(|key| {
                Fernet::new(key)
                    .ok_or_else(|| CryptoError::InvalidFernetKey("bad key encoding".into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            fernet: MultiFernet::new(fernets),
        })
    }

    /// Authenticate and parse a token; signature failures are indistinguishable
    /// from unknown keys by design of the Fernet format
    pub fn verify(&self, token: &str) -> Result<TokenPayload, CryptoError> {
        let plaintext = self
            .fernet
            .decrypt(token)
            .map_err(|_| CryptoError::TokenRejected)?;
        TokenPayload::decode(&plaintext)
    }
}

/// Current time as unix seconds, the clock tokens are judged against
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Decode base64 key material of an exact expected length
pub fn decode_key_material(encoded: &str, expected: usize) -> Result<Vec<u8>, CryptoError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    if bytes.len() != expected {
        return Err(CryptoError::InvalidKeyLength);
    }
    Ok(bytes)
}
