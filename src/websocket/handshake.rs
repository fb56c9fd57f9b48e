//! WebSocket opening handshake.
//!
//! The negotiator is a pure function over the bytes received so far on a
//! freshly accepted connection. The event loop calls [`negotiate`] after
//! every read until it reports [`Negotiation::Accepted`] or an error, so a
//! slow client never blocks the loop.

use crate::runtime::PeerAddr;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// Fixed GUID appended to the client key (RFC 6455 section 1.3).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header block limit; anything longer without a terminator is rejected.
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parsed opening request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub method: String,
    pub target: String,
    /// Header values keyed by lowercase name; the last occurrence wins.
    pub headers: HashMap<String, String>,
    pub peer: PeerAddr,
}

impl HandshakeInfo {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Outcome of a negotiation attempt.
#[derive(Debug)]
pub enum Negotiation {
    /// Header block not fully received yet.
    Incomplete,
    /// Request accepted; `response` must be written to the client and
    /// `consumed` bytes dropped from the receive buffer.
    Accepted {
        info: HandshakeInfo,
        response: String,
        consumed: usize,
    },
}

/// Handshake failures. The connection is dropped without a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    MalformedRequest(&'static str),
    MissingKey,
    RequestTooLarge(usize),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::MalformedRequest(reason) => write!(f, "malformed request: {reason}"),
            HandshakeError::MissingKey => write!(f, "missing or empty Sec-WebSocket-Key header"),
            HandshakeError::RequestTooLarge(len) => {
                write!(f, "request header block too large: {len} bytes")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Build the 101 upgrade response.
pub fn upgrade_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

/// Try to negotiate the handshake from the buffered request bytes.
pub fn negotiate(buf: &[u8], peer: &PeerAddr) -> Result<Negotiation, HandshakeError> {
    let Some(end) = find_terminator(buf) else {
        if buf.len() > MAX_REQUEST_SIZE {
            return Err(HandshakeError::RequestTooLarge(buf.len()));
        }
        return Ok(Negotiation::Incomplete);
    };

    let head = std::str::from_utf8(&buf[..end])
        .map_err(|_| HandshakeError::MalformedRequest("request is not valid UTF-8"))?;
    let mut lines = head.split("\r\n");

    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line
        .next()
        .ok_or(HandshakeError::MalformedRequest("empty request line"))?;
    let target = request_line
        .next()
        .ok_or(HandshakeError::MalformedRequest("missing request target"))?;

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = parse_header(line) {
            headers.insert(name.to_ascii_lowercase(), value.to_string());
        }
    }

    let info = HandshakeInfo {
        method: method.to_string(),
        target: target.to_string(),
        headers,
        peer: peer.clone(),
    };

    let key = info
        .header("Sec-WebSocket-Key")
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingKey)?;
    let response = upgrade_response(&accept_key(key));

    Ok(Negotiation::Accepted {
        info,
        response,
        consumed: end + HEADER_TERMINATOR.len(),
    })
}

/// Split `name: value`; lines whose name is not a single token are ignored.
fn parse_header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some((name, value.trim()))
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "GET /chat HTTP/1.1\r\n\
                           Host: server.example.com\r\n\
                           Upgrade: websocket\r\n\
                           Connection: Upgrade\r\n\
                           Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                           Sec-WebSocket-Version: 13\r\n\
                           \r\n";

    fn peer() -> PeerAddr {
        PeerAddr::Tcp("127.0.0.1:50000".parse().unwrap())
    }

    #[test]
    fn test_accept_key_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_negotiate_accepts_valid_request() {
        match negotiate(REQUEST.as_bytes(), &peer()).unwrap() {
            Negotiation::Accepted {
                info,
                response,
                consumed,
            } => {
                assert_eq!(consumed, REQUEST.len());
                assert_eq!(info.method, "GET");
                assert_eq!(info.target, "/chat");
                assert_eq!(info.header("host"), Some("server.example.com"));
                assert_eq!(info.peer, peer());
                assert_eq!(
                    response,
                    "HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
                );
            }
            Negotiation::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn test_negotiate_waits_for_terminator() {
        let partial = &REQUEST.as_bytes()[..REQUEST.len() - 2];
        assert!(matches!(
            negotiate(partial, &peer()),
            Ok(Negotiation::Incomplete)
        ));
    }

    #[test]
    fn test_negotiate_leaves_trailing_bytes() {
        let mut buf = REQUEST.as_bytes().to_vec();
        buf.extend_from_slice(&[0x81, 0x80]);
        match negotiate(&buf, &peer()).unwrap() {
            Negotiation::Accepted { consumed, .. } => assert_eq!(consumed, REQUEST.len()),
            Negotiation::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn test_missing_key_rejected() {
        let request = "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(
            negotiate(request.as_bytes(), &peer()).unwrap_err(),
            HandshakeError::MissingKey
        );
    }

    #[test]
    fn test_empty_key_rejected() {
        let request = "GET / HTTP/1.1\r\nSec-WebSocket-Key: \r\n\r\n";
        assert_eq!(
            negotiate(request.as_bytes(), &peer()).unwrap_err(),
            HandshakeError::MissingKey
        );
    }

    #[test]
    fn test_last_header_wins() {
        let request = "GET / HTTP/1.1\r\n\
                       Sec-WebSocket-Key: first\r\n\
                       sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        match negotiate(request.as_bytes(), &peer()).unwrap() {
            Negotiation::Accepted { response, .. } => {
                assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
            }
            Negotiation::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn test_malformed_request_line() {
        assert!(matches!(
            negotiate(b"GET\r\n\r\n", &peer()),
            Err(HandshakeError::MalformedRequest(_))
        ));
        assert!(matches!(
            negotiate(b"\r\n\r\n", &peer()),
            Err(HandshakeError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_non_header_lines_ignored() {
        let request = "GET / HTTP/1.1\r\n\
                       garbage line\r\n\
                       Bad Name: x\r\n\
                       Sec-WebSocket-Key: abc\r\n\r\n";
        match negotiate(request.as_bytes(), &peer()).unwrap() {
            Negotiation::Accepted { info, .. } => {
                assert_eq!(info.headers.len(), 1);
                assert_eq!(info.header("Sec-WebSocket-Key"), Some("abc"));
            }
            Negotiation::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn test_oversized_request_rejected() {
        let buf = vec![b'a'; MAX_REQUEST_SIZE + 1];
        assert_eq!(
            negotiate(&buf, &peer()).unwrap_err(),
            HandshakeError::RequestTooLarge(MAX_REQUEST_SIZE + 1)
        );
    }
}
