//! Upgrade handshake
//!
//! Before streaming, the host writes a fixed pseudo-HTTP upgrade request to
//! the bulk-out endpoint and reads one packet back. The device is accepted
//! iff the reply, decoded as ASCII, starts with `HTTP/1.1`. No header parsing
//! happens beyond that prefix check.

use crate::error::HandshakeError;

/// Upgrade request written verbatim over bulk-out
pub const UPGRADE_REQUEST: &[u8] = concat!(
    "GET /index.html\n",
    "HTTP/1.1\n",
    "Connection: Upgrade\n",
    "Upgrade: websocket\n",
    "Sec-WebSocket-Key: 123abc\n",
    "\n",
)
.as_bytes();

/// Prefix an accepted response starts with
pub const UPGRADE_RESPONSE_PREFIX: &str = "HTTP/1.1";

/// Decode a handshake response as ASCII
///
/// Non-ASCII bytes become U+FFFD so the rejected text can still be logged.
pub fn decode_response(data: &[u8]) -> String {
    data.iter()
        .map(|&b| if b.is_ascii() { b as char } else { '\u{fffd}' })
        .collect()
}

/// Check a response against an expected prefix
pub fn check_response_prefix(data: &[u8], prefix: &str) -> Result<(), HandshakeError> {
    let response = decode_response(data);
    if response.starts_with(prefix) {
        Ok(())
    } else {
        Err(HandshakeError::Rejected { response })
    }
}

/// Check a response against [`UPGRADE_RESPONSE_PREFIX`]
pub fn check_upgrade_response(data: &[u8]) -> Result<(), HandshakeError> {
    check_response_prefix(data, UPGRADE_RESPONSE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_bytes() {
        let text = std::str::from_utf8(UPGRADE_REQUEST).unwrap();
        assert!(text.starts_with("GET /index.html\n"));
        assert!(text.contains("Sec-WebSocket-Key: 123abc\n"));
        assert!(text.ends_with("\n\n"));
        assert!(UPGRADE_REQUEST.is_ascii());
    }

    #[test]
    fn test_accepts_prefix() {
        assert!(check_upgrade_response(b"HTTP/1.1").is_ok());
        assert!(check_upgrade_response(b"HTTP/1.1 101 Switching Protocols\r\n").is_ok());
    }

    #[test]
    fn test_rejects_other_responses() {
        assert!(check_upgrade_response(b"").is_err());
        assert!(check_upgrade_response(b"HTTP/1.0 200 OK").is_err());
        assert!(check_upgrade_response(b" HTTP/1.1").is_err());
        assert!(check_upgrade_response(b"http/1.1").is_err());
    }

    #[test]
    fn test_rejection_carries_response() {
        let err = check_upgrade_response(b"\x82\x05hello").unwrap_err();
        let HandshakeError::Rejected { response } = err;
        assert!(response.ends_with("hello"));
        assert!(response.starts_with('\u{fffd}'));
    }
}
