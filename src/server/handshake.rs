//! Tunnel handshake, server side
//!
//! ```text
//! client                                server
//!   | -- hello nonce (32) ----------------> |
//!   | <------------------ challenge (32) -- |
//!   | -- len (2) + fernet token ----------> |  verify, decode, compare
//! ```
//!
//! The token plaintext must embed the challenge just issued, an unexpired
//! `valid_until` and at least one ASCII hostname. Any failure closes the
//! socket with no response.

use super::AuthenticationError;
use crate::crypto::{random_array32, unix_now, TokenPayload, TokenVerifier};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Deadline for the whole handshake exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest token the server will read
const MAX_TOKEN_LEN: usize = 4096;

/// Run the server side of the tunnel handshake and return the validated
/// token payload
pub async fn server_handshake<S>(
    stream: &mut S,
    verifier: &TokenVerifier,
) -> Result<TokenPayload, AuthenticationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; 32];
    stream.read_exact(&mut hello).await?;

    let challenge = random_array32();
    stream.write_all(&challenge).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let token_len = u16::from_be_bytes(len_buf) as usize;
    if token_len == 0 || token_len > MAX_TOKEN_LEN {
        return Err(AuthenticationError::InvalidToken);
    }

    let mut token = vec![0u8; token_len];
    stream.read_exact(&mut token).await?;
    let token = std::str::from_utf8(&token).map_err(|_| AuthenticationError::InvalidToken)?;

    let mut payload = verifier
        .verify(token)
        .map_err(|_| AuthenticationError::InvalidToken)?;

    if payload.challenge[..].ct_eq(&challenge[..]).unwrap_u8() == 0 {
        return Err(AuthenticationError::ChallengeMismatch);
    }
    if payload.valid_until <= unix_now() {
        return Err(AuthenticationError::TokenExpired);
    }

    payload.hostnames = normalize_hostnames(payload.hostnames)?;
    debug!(hostnames = ?payload.hostnames, "Handshake token accepted");
    Ok(payload)
}

/// Lowercase hostnames, rejecting empty or non-ASCII names
fn normalize_hostnames(hostnames: Vec<String>) -> Result<Vec<String>, AuthenticationError> {
    hostnames
        .into_iter()
        .map(|hostname| {
            if hostname.is_empty() || !hostname.is_ascii() {
                return Err(AuthenticationError::InvalidHostname(hostname));
            }
            Ok(hostname.to_ascii_lowercase())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_bytes, TokenIssuer};
    use fernet::Fernet;
    use tokio::io::duplex;

    fn issuer_and_verifier() -> (TokenIssuer, TokenVerifier) {
        let key = Fernet::generate_key();
        (
            TokenIssuer::new(&key).unwrap(),
            TokenVerifier::new(&[key]).unwrap(),
        )
    }

    fn payload_with(challenge: [u8; 32], valid_until: u64) -> TokenPayload {
        let mut aes_iv = [0u8; 16];
        random_bytes(&mut aes_iv);
        TokenPayload {
            challenge,
            identity: random_array32(),
            valid_until,
            hostnames: vec!["Example.COM".into()],
            aes_key: random_array32(),
            aes_iv,
        }
    }

    async fn drive_client(
        mut client: tokio::io::DuplexStream,
        issuer: TokenIssuer,
        valid_until: u64,
        echo_challenge: bool,
    ) {
        client.write_all(&random_array32()).await.unwrap();

        let mut challenge = [0u8; 32];
        client.read_exact(&mut challenge).await.unwrap();
        if !echo_challenge {
            challenge = random_array32();
        }

        let token = issuer.mint(&payload_with(challenge, valid_until));
        client
            .write_all(&(token.len() as u16).to_be_bytes())
            .await
            .unwrap();
        client.write_all(token.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_accepts_and_normalizes() {
        let (issuer, verifier) = issuer_and_verifier();
        let (client, mut server) = duplex(4096);

        let driver = tokio::spawn(drive_client(client, issuer, unix_now() + 60, true));
        let payload = server_handshake(&mut server, &verifier).await.unwrap();
        driver.await.unwrap();

        assert_eq!(payload.hostnames, vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_handshake_rejects_expired() {
        let (issuer, verifier) = issuer_and_verifier();
        let (client, mut server) = duplex(4096);

        // Boundary: valid_until == now must already be rejected
        let driver = tokio::spawn(drive_client(client, issuer, unix_now(), true));
        let err = server_handshake(&mut server, &verifier).await.unwrap_err();
        driver.await.unwrap();

        assert!(matches!(err, AuthenticationError::TokenExpired));
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_challenge() {
        let (issuer, verifier) = issuer_and_verifier();
        let (client, mut server) = duplex(4096);

        let driver = tokio::spawn(drive_client(client, issuer, unix_now() + 60, false));
        let err = server_handshake(&mut server, &verifier).await.unwrap_err();
        driver.await.unwrap();

        assert!(matches!(err, AuthenticationError::ChallengeMismatch));
    }

    #[tokio::test]
    async fn test_handshake_rejects_foreign_token() {
        let (_, verifier) = issuer_and_verifier();
        let (foreign_issuer, _) = issuer_and_verifier();
        let (client, mut server) = duplex(4096);

        let driver = tokio::spawn(drive_client(client, foreign_issuer, unix_now() + 60, true));
        let err = server_handshake(&mut server, &verifier).await.unwrap_err();
        driver.await.unwrap();

        assert!(matches!(err, AuthenticationError::InvalidToken));
    }
}
