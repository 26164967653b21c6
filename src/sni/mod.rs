//! Minimal TLS parsing to extract the SNI hostname
//!
//! Walks just enough of a TLS record and ClientHello to reach the
//! server_name extension. The payload stays opaque; nothing here
//! negotiates or terminates TLS.

use bytes::Buf;
use std::io::Cursor;
use thiserror::Error;

/// Most bytes the dispatcher will buffer while waiting for a ClientHello
pub const MAX_HELLO_READ: usize = 2048;

/// TLS content type for handshake records
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension number for server_name
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// SNI name type for host_name entries
const NAME_TYPE_HOST: u8 = 0x00;

/// SNI parsing errors
#[derive(Debug, Error)]
pub enum ParseSniError {
    #[error("Not a TLS handshake record")]
    NotTls,

    #[error("Not a ClientHello")]
    NotClientHello,

    #[error("Malformed ClientHello")]
    Malformed,

    #[error("ClientHello carries no server_name")]
    SniMissing,
}

/// Extract the SNI hostname from the start of a TLS connection.
///
/// Returns `Ok(None)` while the buffer does not yet hold the whole
/// ClientHello; the caller feeds more bytes, bounded by its own timeout.
pub fn parse_client_hello_sni(buf: &[u8]) -> Result<Option<String>, ParseSniError> {
    let mut cursor = Cursor::new(buf);

    // TLS record header (5 bytes)
    if cursor.remaining() < 5 {
        return Ok(None);
    }
    let content_type = cursor.get_u8();
    let version_major = cursor.get_u8();
    let _version_minor = cursor.get_u8();
    let record_len = cursor.get_u16() as usize;

    if content_type != CONTENT_TYPE_HANDSHAKE || version_major != 0x03 {
        return Err(ParseSniError::NotTls);
    }
    if cursor.remaining() < record_len {
        return Ok(None);
    }

    let mut hello = Cursor::new(&buf[5..5 + record_len]);

    // Handshake header: type (1) + length (3)
    if hello.remaining() < 4 {
        return Err(ParseSniError::Malformed);
    }
    if hello.get_u8() != HANDSHAKE_CLIENT_HELLO {
        return Err(ParseSniError::NotClientHello);
    }
    hello.advance(3);

    // client_version (2) + random (32)
    if hello.remaining() < 34 {
        return Err(ParseSniError::Malformed);
    }
    hello.advance(34);

    // session_id
    if hello.remaining() < 1 {
        return Err(ParseSniError::Malformed);
    }
    let session_id_len = hello.get_u8() as usize;
    if hello.remaining() < session_id_len {
        return Err(ParseSniError::Malformed);
    }
    hello.advance(session_id_len);

    // cipher_suites
    if hello.remaining() < 2 {
        return Err(ParseSniError::Malformed);
    }
    let cipher_suites_len = hello.get_u16() as usize;
    if hello.remaining() < cipher_suites_len {
        return Err(ParseSniError::Malformed);
    }
    hello.advance(cipher_suites_len);

    // compression_methods
    if hello.remaining() < 1 {
        return Err(ParseSniError::Malformed);
    }
    let compression_len = hello.get_u8() as usize;
    if hello.remaining() < compression_len {
        return Err(ParseSniError::Malformed);
    }
    hello.advance(compression_len);

    // extensions
    if hello.remaining() < 2 {
        return Err(ParseSniError::SniMissing);
    }
    let extensions_len = hello.get_u16() as usize;
    if hello.remaining() < extensions_len {
        return Err(ParseSniError::Malformed);
    }

    while hello.remaining() >= 4 {
        let ext_type = hello.get_u16();
        let ext_len = hello.get_u16() as usize;
        if hello.remaining() < ext_len {
            return Err(ParseSniError::Malformed);
        }

        if ext_type != EXTENSION_SERVER_NAME {
            hello.advance(ext_len);
            continue;
        }

        let position = hello.position() as usize;
        return parse_server_name(&hello.get_ref()[position..position + ext_len]);
    }

    Err(ParseSniError::SniMissing)
}

/// Walk the server_name extension body and return the first host_name entry
fn parse_server_name(body: &[u8]) -> Result<Option<String>, ParseSniError> {
    let mut cursor = Cursor::new(body);

    if cursor.remaining() < 2 {
        return Err(ParseSniError::Malformed);
    }
    let list_len = cursor.get_u16() as usize;
    if cursor.remaining() < list_len {
        return Err(ParseSniError::Malformed);
    }

    while cursor.remaining() >= 3 {
        let name_type = cursor.get_u8();
        let name_len = cursor.get_u16() as usize;
        if cursor.remaining() < name_len {
            return Err(ParseSniError::Malformed);
        }

        if name_type == NAME_TYPE_HOST {
            let position = cursor.position() as usize;
            let name = std::str::from_utf8(&body[position..position + name_len])
                .map_err(|_| ParseSniError::Malformed)?;
            if name.is_empty() {
                return Err(ParseSniError::Malformed);
            }
            return Ok(Some(name.to_string()));
        }
        cursor.advance(name_len);
    }

    Err(ParseSniError::SniMissing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_hostname() {
        let hello = testing::build_client_hello("example.com");
        let sni = parse_client_hello_sni(&hello).unwrap();
        assert_eq!(sni.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_incomplete_buffer() {
        let hello = testing::build_client_hello("example.com");
        assert!(parse_client_hello_sni(&hello[..3]).unwrap().is_none());
        assert!(parse_client_hello_sni(&hello[..hello.len() - 1])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_not_tls() {
        let err = parse_client_hello_sni(b"GET / HTTP/1.0\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseSniError::NotTls));
    }

    #[test]
    fn test_not_client_hello() {
        let mut hello = testing::build_client_hello("example.com");
        hello[5] = 0x02; // ServerHello
        assert!(matches!(
            parse_client_hello_sni(&hello),
            Err(ParseSniError::NotClientHello)
        ));
    }

    #[test]
    fn test_sni_absent() {
        let hello = testing::build_client_hello_without_sni();
        assert!(matches!(
            parse_client_hello_sni(&hello),
            Err(ParseSniError::SniMissing)
        ));
    }
}

pub mod testing {
    //! ClientHello builders for tests

    use bytes::{BufMut, BytesMut};

    /// Assemble a syntactically valid TLS 1.2 ClientHello carrying `hostname`
    pub fn build_client_hello(hostname: &str) -> Vec<u8> {
        build(Some(hostname))
    }

    /// Assemble a ClientHello without a server_name extension
    pub fn build_client_hello_without_sni() -> Vec<u8> {
        build(None)
    }

    fn build(hostname: Option<&str>) -> Vec<u8> {
        let mut extensions = BytesMut::new();
        if let Some(name) = hostname {
            let name = name.as_bytes();
            extensions.put_u16(0x0000); // server_name
            extensions.put_u16(name.len() as u16 + 5);
            extensions.put_u16(name.len() as u16 + 3); // server_name_list
            extensions.put_u8(0); // host_name
            extensions.put_u16(name.len() as u16);
            extensions.put_slice(name);
        }
        // an unrelated extension the parser must skip
        extensions.put_u16(0x000a); // supported_groups
        extensions.put_u16(4);
        extensions.put_u16(2);
        extensions.put_u16(0x001d);

        let mut body = BytesMut::new();
        body.put_u16(0x0303); // client_version
        body.put_slice(&[0x42u8; 32]); // random
        body.put_u8(0); // session_id
        body.put_u16(2); // cipher_suites
        body.put_u16(0x1301);
        body.put_u8(1); // compression_methods
        body.put_u8(0);
        body.put_u16(extensions.len() as u16);
        body.put_slice(&extensions);

        let mut hello = BytesMut::new();
        hello.put_u8(0x16); // handshake record
        hello.put_u16(0x0301);
        hello.put_u16(body.len() as u16 + 4);
        hello.put_u8(0x01); // ClientHello
        hello.put_u8(0);
        hello.put_u16(body.len() as u16); // 24-bit length, high byte zero
        hello.put_slice(&body);

        hello.to_vec()
    }
}
