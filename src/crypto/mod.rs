//! Cryptographic primitives for SniTun
//!
//! This module provides:
//! - AES-256-CBC frame encryption (one chained cipher state per direction)
//! - Fernet token minting and verification for the peer handshake
//! - Secure random number generation

mod frame;
mod token;

pub use frame::{padded_len, pkcs7_pad, pkcs7_unpad, FrameDecryptor, FrameEncryptor};
pub use token::{decode_key_material, unix_now, TokenIssuer, TokenPayload, TokenVerifier};

use thiserror::Error;

/// Length of the AES session key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the CBC initialization vector in bytes
pub const IV_LEN: usize = 16;

/// AES block size in bytes
pub const BLOCK_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid Fernet key: {0}")]
    InvalidFernetKey(String),

    #[error("Token rejected")]
    TokenRejected,

    #[error("Malformed token payload")]
    MalformedToken,

    #[error("Ciphertext not block aligned")]
    NotBlockAligned,

    #[error("Invalid padding")]
    InvalidPadding,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// Generate a random 32-byte value (challenges, identities, session keys)
pub fn random_array32() -> [u8; 32] {
    let mut buf = [0u8; 32];
    random_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }
}
