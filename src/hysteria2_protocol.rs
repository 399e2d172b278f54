//! Hysteria2 protocol constants and framing.
//!
//! Reference: https://github.com/apernet/hysteria/blob/master/PROTOCOL.md

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use http::HeaderMap;
use rand::distr::Alphanumeric;
use rand::{Rng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt};

/// HTTP/3 authentication request URI host
pub const AUTH_HOST: &str = "hysteria";

/// HTTP/3 authentication request URI path
pub const AUTH_PATH: &str = "/auth";

/// HTTP status code for successful authentication (HyOK)
pub const STATUS_AUTH_OK: u16 = 233;

/// Header names
pub mod header {
    /// Client authentication header
    pub const AUTH: &str = "Hysteria-Auth";
    /// UDP enabled response header
    pub const UDP: &str = "Hysteria-UDP";
    /// Congestion control (bandwidth) header
    pub const CC_RX: &str = "Hysteria-CC-RX";
    /// Padding header for obfuscation
    pub const PADDING: &str = "Hysteria-Padding";
}

/// `Hysteria-CC-RX` value in a response when the server has no fixed receive rate.
pub const CC_RX_AUTO: &str = "auto";

/// TCP request frame type from Hysteria2 protocol
pub const FRAME_TYPE_TCP_REQUEST: u64 = 0x401;

/// TCP response status codes
pub mod tcp_status {
    /// Request accepted
    pub const OK: u8 = 0x00;
    /// Request rejected
    pub const ERROR: u8 = 0x01;
}

/// Longest destination address accepted in a TCP request
pub const MAX_ADDRESS_LENGTH: usize = 2048;

/// Longest padding accepted in a TCP request
pub const MAX_PADDING_LENGTH: usize = 4096;

/// Maximum error message length accepted in a TCP response
pub const MAX_MESSAGE_LENGTH: usize = 2048;

pub const AUTH_RESPONSE_PADDING: Range<usize> = 256..2048;
pub const TCP_REQUEST_PADDING: Range<usize> = 64..512;
pub const TCP_RESPONSE_PADDING: Range<usize> = 128..1024;

const MAX_VARINT: u64 = (1 << 62) - 1;

/// Fields read from the authentication request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequest {
    pub auth: String,
    /// Client declared receive rate in bytes per second, 0 when not declared.
    pub rx: u64,
}

impl AuthRequest {
    /// Missing or malformed headers read as empty values, so a bad request simply
    /// fails the credential lookup.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let auth = headers
            .get(header::AUTH)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let rx = headers
            .get(header::CC_RX)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(0);
        Self { auth, rx }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthResponse {
    pub udp_enabled: bool,
    /// Server receive rate in bytes per second, 0 when unspecified.
    pub rx: u64,
    pub rx_auto: bool,
}

impl AuthResponse {
    /// Builds the complete HyOK response.
    pub fn to_response(&self) -> std::io::Result<http::Response<()>> {
        let rx = if self.rx_auto {
            CC_RX_AUTO.to_string()
        } else {
            self.rx.to_string()
        };
        http::Response::builder()
            .status(STATUS_AUTH_OK)
            .header(header::UDP, if self.udp_enabled { "true" } else { "false" })
            .header(header::CC_RX, rx)
            .header(header::PADDING, random_padding_string(AUTH_RESPONSE_PADDING))
            .body(())
            .map_err(std::io::Error::other)
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let udp_enabled = headers
            .get(header::UDP)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let rx_value = headers
            .get(header::CC_RX)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if rx_value == CC_RX_AUTO {
            Self {
                udp_enabled,
                rx: 0,
                rx_auto: true,
            }
        } else {
            Self {
                udp_enabled,
                rx: rx_value.parse().unwrap_or(0),
                rx_auto: false,
            }
        }
    }
}

/// Generates a random alphanumeric string with a length in `range`.
pub fn random_padding_string(range: Range<usize>) -> String {
    let mut rng = rand::rng();
    let length = rng.random_range(range);
    (&mut rng)
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn varint_len(value: u64) -> usize {
    if value <= 0b00111111 {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

/// Appends a QUIC variable-length integer.
pub fn put_varint(buf: &mut BytesMut, value: u64) -> std::io::Result<()> {
    if value > MAX_VARINT {
        return Err(std::io::Error::other("value too large to encode as varint"));
    }
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(value as u16 | 0x4000),
        4 => buf.put_u32(value as u32 | 0x8000_0000),
        _ => buf.put_u64(value | 0xc000_0000_0000_0000),
    }
    Ok(())
}

pub async fn read_varint<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> std::io::Result<u64> {
    let first_byte = reader.read_u8().await?;

    let length = (first_byte >> 6) & 0b11; // Get top two bits
    let mut value: u64 = (first_byte & 0b00111111) as u64; // Remaining bits of the first byte

    let num_bytes = 1usize << length;
    if num_bytes > 1 {
        let mut remaining_bytes = [0u8; 7];
        reader
            .read_exact(&mut remaining_bytes[..num_bytes - 1])
            .await?;
        for byte in &remaining_bytes[..num_bytes - 1] {
            value <<= 8; // Shift left by 8 bits for each subsequent byte
            value |= *byte as u64; // Add the next byte
        }
    }

    Ok(value)
}

/// Reads the varint that opens a bidirectional stream, returning it together with
/// the bytes it was encoded in so the stream can be handed on unchanged.
pub async fn read_frame_type<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> std::io::Result<(u64, Bytes)> {
    let mut raw = [0u8; 8];
    raw[0] = reader.read_u8().await?;
    let num_bytes = 1usize << (raw[0] >> 6);
    reader.read_exact(&mut raw[1..num_bytes]).await?;

    let mut value = (raw[0] & 0b00111111) as u64;
    for byte in &raw[1..num_bytes] {
        value = (value << 8) | *byte as u64;
    }
    Ok((value, Bytes::copy_from_slice(&raw[..num_bytes])))
}

/// Reads the body of a TCP request, after its frame type has been consumed:
///
/// ```text
/// [varint] Address length
/// [bytes]  Address string (host:port)
/// [varint] Padding length
/// [bytes]  Random padding
/// ```
pub async fn read_tcp_request<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> std::io::Result<String> {
    let address_length = read_varint(reader).await? as usize;
    if address_length == 0 || address_length > MAX_ADDRESS_LENGTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid address length: {address_length}"),
        ));
    }
    let mut address_bytes = vec![0u8; address_length];
    reader.read_exact(&mut address_bytes).await?;

    let padding_length = read_varint(reader).await? as usize;
    if padding_length > MAX_PADDING_LENGTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid padding length: {padding_length}"),
        ));
    }
    if padding_length > 0 {
        let mut padding_bytes = vec![0u8; padding_length];
        reader.read_exact(&mut padding_bytes).await?;
    }

    String::from_utf8(address_bytes).map_err(|err| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid address: {err}"),
        )
    })
}

/// Encodes a TCP response frame followed by `payload`:
///
/// ```text
/// [uint8]  Status (0x00 = OK, 0x01 = Error)
/// [varint] Message length
/// [bytes]  Message string
/// [varint] Padding length
/// [bytes]  Random padding
/// ```
pub fn encode_tcp_response(ok: bool, message: &str, payload: &[u8]) -> std::io::Result<BytesMut> {
    let padding_len = rand::rng().random_range(TCP_RESPONSE_PADDING);
    let mut frame = BytesMut::with_capacity(
        1 + varint_len(message.len() as u64)
            + message.len()
            + varint_len(padding_len as u64)
            + padding_len
            + payload.len(),
    );
    frame.put_u8(if ok { tcp_status::OK } else { tcp_status::ERROR });
    put_varint(&mut frame, message.len() as u64)?;
    frame.extend_from_slice(message.as_bytes());
    put_varint(&mut frame, padding_len as u64)?;
    let padding_start = frame.len();
    frame.resize(padding_start + padding_len, 0);
    rand::rng().fill_bytes(&mut frame[padding_start..]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Client side of the TCP request framing, used by tests to drive the server.
#[cfg(test)]
pub(crate) fn encode_tcp_request(address: &str) -> std::io::Result<BytesMut> {
    let padding_len = rand::rng().random_range(TCP_REQUEST_PADDING);
    let mut request = BytesMut::new();
    put_varint(&mut request, FRAME_TYPE_TCP_REQUEST)?;
    put_varint(&mut request, address.len() as u64)?;
    request.extend_from_slice(address.as_bytes());
    put_varint(&mut request, padding_len as u64)?;
    request.resize(request.len() + padding_len, b'p');
    Ok(request)
}

/// Reads a TCP response header, returning the status and message.
#[cfg(test)]
pub(crate) async fn read_tcp_response<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> std::io::Result<(bool, String)> {
    let status = reader.read_u8().await?;
    let message_length = read_varint(reader).await? as usize;
    if message_length > MAX_MESSAGE_LENGTH {
        return Err(std::io::Error::other("message too long"));
    }
    let mut message = vec![0u8; message_length];
    reader.read_exact(&mut message).await?;
    let padding_length = read_varint(reader).await? as usize;
    if padding_length > MAX_PADDING_LENGTH {
        return Err(std::io::Error::other("padding too long"));
    }
    let mut padding = vec![0u8; padding_length];
    reader.read_exact(&mut padding).await?;
    Ok((
        status == tcp_status::OK,
        String::from_utf8_lossy(&message).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, value).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_put_varint() {
        // Single byte (0-63)
        assert_eq!(encode(0), [0]);
        assert_eq!(encode(63), [63]);

        // Two bytes (64-16383)
        assert_eq!(encode(64), [0b01000000, 64]);
        assert_eq!(encode(16383), [0b01111111, 255]);

        // Frame type of a TCP request
        assert_eq!(encode(FRAME_TYPE_TCP_REQUEST), [0x44, 0x01]);

        // Four and eight bytes
        assert_eq!(encode(16384)[0] & 0b11000000, 0b10000000);
        assert_eq!(encode(1 << 30).len(), 8);

        let mut buf = BytesMut::new();
        assert!(put_varint(&mut buf, 1 << 62).is_err());
    }

    #[tokio::test]
    async fn test_read_varint_all_lengths() {
        for value in [0u64, 37, 15293, 494878333, 151288809941952652] {
            let bytes = encode(value);
            let mut reader = &bytes[..];
            assert_eq!(read_varint(&mut reader).await.unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[tokio::test]
    async fn test_read_varint_truncated() {
        let bytes = [0x80u8, 0x01];
        let mut reader = &bytes[..];
        let err = read_varint(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_frame_type_keeps_raw_bytes() {
        let request = encode_tcp_request("example.com:443").unwrap();
        let mut reader = &request[..];
        let (frame_type, raw) = read_frame_type(&mut reader).await.unwrap();
        assert_eq!(frame_type, FRAME_TYPE_TCP_REQUEST);
        assert_eq!(raw.as_ref(), [0x44, 0x01]);
        assert_eq!(reader.len(), request.len() - 2);

        // an HTTP/3 HEADERS frame
        let mut reader = &[0x01u8, 0x05][..];
        let (frame_type, raw) = read_frame_type(&mut reader).await.unwrap();
        assert_eq!(frame_type, 0x01);
        assert_eq!(raw.as_ref(), [0x01]);

        let mut reader = &[0xc0u8, 0, 0][..];
        let err = read_frame_type(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_tcp_request() {
        let request = encode_tcp_request("example.com:443").unwrap();
        let mut reader = &request[..];
        assert_eq!(
            read_varint(&mut reader).await.unwrap(),
            FRAME_TYPE_TCP_REQUEST
        );
        assert_eq!(
            read_tcp_request(&mut reader).await.unwrap(),
            "example.com:443"
        );
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_read_tcp_request_rejects_oversized_fields() {
        let mut request = BytesMut::new();
        put_varint(&mut request, (MAX_ADDRESS_LENGTH + 1) as u64).unwrap();
        let mut reader = &request[..];
        assert!(read_tcp_request(&mut reader).await.is_err());

        let mut request = BytesMut::new();
        put_varint(&mut request, 4).unwrap();
        request.extend_from_slice(b"a:80");
        put_varint(&mut request, (MAX_PADDING_LENGTH + 1) as u64).unwrap();
        let mut reader = &request[..];
        assert!(read_tcp_request(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_read_tcp_request_rejects_invalid_utf8() {
        let mut request = BytesMut::new();
        put_varint(&mut request, 2).unwrap();
        request.extend_from_slice(&[0xff, 0xfe]);
        put_varint(&mut request, 0).unwrap();
        let mut reader = &request[..];
        let err = read_tcp_request(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_tcp_response_with_payload() {
        let frame = encode_tcp_response(true, "", b"hello").unwrap();
        let mut reader = &frame[..];
        let (ok, message) = read_tcp_response(&mut reader).await.unwrap();
        assert!(ok);
        assert!(message.is_empty());
        assert_eq!(reader, b"hello");
    }

    #[tokio::test]
    async fn test_tcp_error_response() {
        let frame = encode_tcp_response(false, "connection refused", &[]).unwrap();
        assert_eq!(frame[0], tcp_status::ERROR);
        let mut reader = &frame[..];
        let (ok, message) = read_tcp_response(&mut reader).await.unwrap();
        assert!(!ok);
        assert_eq!(message, "connection refused");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_auth_request_from_headers() {
        let request = http::Request::builder()
            .header("hysteria-auth", "s1")
            .header(header::CC_RX, "1000000")
            .body(())
            .unwrap();
        assert_eq!(
            AuthRequest::from_headers(request.headers()),
            AuthRequest {
                auth: "s1".to_string(),
                rx: 1_000_000,
            }
        );

        let request = http::Request::builder()
            .header(header::CC_RX, "fast")
            .body(())
            .unwrap();
        assert_eq!(
            AuthRequest::from_headers(request.headers()),
            AuthRequest::default()
        );
    }

    #[test]
    fn test_auth_response_headers() {
        let response = AuthResponse {
            udp_enabled: true,
            rx: 0,
            rx_auto: true,
        }
        .to_response()
        .unwrap();
        assert_eq!(response.status().as_u16(), STATUS_AUTH_OK);
        assert_eq!(response.headers()[header::UDP], "true");
        assert_eq!(response.headers()[header::CC_RX], CC_RX_AUTO);
        let padding = response.headers()[header::PADDING].to_str().unwrap();
        assert!(AUTH_RESPONSE_PADDING.contains(&padding.len()));

        let fixed = AuthResponse {
            udp_enabled: false,
            rx: 200_000,
            rx_auto: false,
        };
        let response = fixed.to_response().unwrap();
        assert_eq!(response.headers()[header::UDP], "false");
        assert_eq!(response.headers()[header::CC_RX], "200000");
        assert_eq!(AuthResponse::from_headers(response.headers()), fixed);
    }

    #[test]
    fn test_random_padding_string() {
        let s1 = random_padding_string(AUTH_RESPONSE_PADDING);
        let s2 = random_padding_string(AUTH_RESPONSE_PADDING);
        // Should generate different strings (very unlikely to be the same)
        assert_ne!(s1, s2);
        assert!(s1.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
