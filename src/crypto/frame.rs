//! AES-256-CBC frame encryption
//!
//! Each tunnel direction owns one cipher whose CBC state chains across
//! frames, seeded by the session key and IV from the handshake token.
//! Frame headers are encrypted without padding (their size is exactly two
//! blocks); payloads are PKCS#7 padded to the next block boundary.

use super::{CryptoError, BLOCK_LEN, IV_LEN, KEY_LEN};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypting half of a frame cipher pair
pub struct FrameEncryptor {
    cipher: Aes256CbcEnc,
}

/// Decrypting half of a frame cipher pair
pub struct FrameDecryptor {
    cipher: Aes256CbcDec,
}

impl FrameEncryptor {
    /// Create an encryptor from a 32-byte key and 16-byte IV
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN || iv.len() != IV_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        let cipher =
            Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { cipher })
    }

    /// Encrypt a block-aligned buffer in place, advancing the CBC chain
    pub fn encrypt(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        if buf.len() % BLOCK_LEN != 0 {
            return Err(CryptoError::NotBlockAligned);
        }
        for block in buf.chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

impl FrameDecryptor {
    /// Create a decryptor from a 32-byte key and 16-byte IV
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN || iv.len() != IV_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        let cipher =
            Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { cipher })
    }

    /// Decrypt a block-aligned buffer in place, advancing the CBC chain
    pub fn decrypt(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        if buf.len() % BLOCK_LEN != 0 {
            return Err(CryptoError::NotBlockAligned);
        }
        for block in buf.chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

/// Ciphertext length of a PKCS#7 padded payload of `len` plaintext bytes
pub fn padded_len(len: usize) -> usize {
    (len / BLOCK_LEN + 1) * BLOCK_LEN
}

/// Append PKCS#7 padding up to the next block boundary
pub fn pkcs7_pad(buf: &mut Vec<u8>) {
    let pad = BLOCK_LEN - buf.len() % BLOCK_LEN;
    buf.resize(buf.len() + pad, pad as u8);
}

/// Validate PKCS#7 padding and return the unpadded length
pub fn pkcs7_unpad(buf: &[u8]) -> Result<usize, CryptoError> {
    if buf.is_empty() || buf.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::InvalidPadding);
    }
    let pad = buf[buf.len() - 1] as usize;
    if pad == 0 || pad > BLOCK_LEN || pad > buf.len() {
        return Err(CryptoError::InvalidPadding);
    }
    if !buf[buf.len() - pad..].iter().all(|&b| b as usize == pad) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(buf.len() - pad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    fn cipher_pair() -> (FrameEncryptor, FrameDecryptor) {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        random_bytes(&mut key);
        random_bytes(&mut iv);
        (
            FrameEncryptor::new(&key, &iv).unwrap(),
            FrameDecryptor::new(&key, &iv).unwrap(),
        )
    }

    #[test]
    fn test_encrypt_decrypt_chained() {
        let (mut enc, mut dec) = cipher_pair();

        // Two consecutive buffers must survive the chained state
        for msg in [&b"0123456789abcdef"[..], &b"fedcba9876543210"[..]] {
            let mut buf = msg.to_vec();
            enc.encrypt(&mut buf).unwrap();
            assert_ne!(&buf[..], msg);
            dec.decrypt(&mut buf).unwrap();
            assert_eq!(&buf[..], msg);
        }
    }

    #[test]
    fn test_unaligned_rejected() {
        let (mut enc, _) = cipher_pair();
        let mut buf = vec![0u8; 15];
        assert!(enc.encrypt(&mut buf).is_err());
    }

    #[test]
    fn test_pkcs7_roundtrip() {
        for len in [0usize, 1, 15, 16, 17, 4096] {
            let mut buf: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let original = buf.clone();
            pkcs7_pad(&mut buf);
            assert_eq!(buf.len(), padded_len(len));
            assert_eq!(pkcs7_unpad(&buf).unwrap(), len);
            assert_eq!(&buf[..len], &original[..]);
        }
    }

    #[test]
    fn test_pkcs7_bad_padding() {
        let mut buf = vec![0u8; 16];
        buf[15] = 17;
        assert!(pkcs7_unpad(&buf).is_err());
        assert!(pkcs7_unpad(&[]).is_err());
    }
}
