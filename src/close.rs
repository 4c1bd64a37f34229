//! # Close
//!
//! Status codes and the payload layout of close frames, [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
//!
//! A close payload is either empty or a 2-byte big-endian status code followed by a UTF-8
//! reason. The whole payload is a control frame payload, so the reason gets at most 123 bytes.
use bytes::{BufMut, BytesMut};

use crate::{Result, WebSocketError};

/// Largest reason, in bytes, that fits next to a status code in a control frame.
pub const MAX_REASON_LEN: usize = 123;

/// Status code explaining why an endpoint closed the connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the purpose of the connection has been fulfilled.
    Normal,
    /// 1001: the endpoint is going away, e.g. a server shutting down.
    Away,
    /// 1002: the peer broke the protocol.
    Protocol,
    /// 1003: the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire.
    Status,
    /// 1006: the connection dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007: message data was inconsistent with its type, such as non UTF-8 text.
    Invalid,
    /// 1008: a message violated the endpoint's policy.
    Policy,
    /// 1009: a message was too big to process.
    Size,
    /// 1010: the client expected the server to negotiate an extension.
    Extension,
    /// 1011: the server hit an unexpected condition.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: the server is overloaded, try again later.
    Again,
    /// 1015: TLS handshake failure. Never sent on the wire.
    Tls,
    /// 1016-2999: reserved for future protocol revisions.
    Reserved(u16),
    /// 3000-3999: registered with IANA for libraries and frameworks.
    Iana(u16),
    /// 4000-4999: private use by applications.
    Library(u16),
    /// Anything else, never valid.
    Bad(u16),
}

impl CloseCode {
    /// Whether the code may appear in a close frame on the wire.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
                | CloseCode::Reserved(_)
                | CloseCode::Bad(_)
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// A decoded close payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    /// Creates a close frame, cutting `reason` down to [`MAX_REASON_LEN`] bytes on a character
    /// boundary.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        truncate_reason(&mut reason);
        Self { code, reason }
    }

    /// Parses a close frame payload.
    ///
    /// # Returns
    /// - `Ok(None)` for an empty payload, which means no status code was given.
    /// - `Ok(Some(frame))` for a code plus an optional reason.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidCloseFrame`] for a 1-byte payload.
    /// - [`WebSocketError::InvalidCloseCode`] for a code that may not be sent.
    /// - [`WebSocketError::InvalidUTF8`] if the reason is not UTF-8.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| WebSocketError::InvalidUTF8)?
                    .to_owned();
                Ok(Some(Self { code, reason }))
            }
        }
    }

    /// Appends the wire form of this close frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(2 + self.reason.len());
        dst.put_u16(self.code.into());
        dst.put_slice(self.reason.as_bytes());
    }

    /// The wire form as a standalone buffer.
    pub fn to_payload(&self) -> BytesMut {
        let mut payload = BytesMut::new();
        self.encode(&mut payload);
        payload
    }
}

fn truncate_reason(reason: &mut String) {
    if reason.len() <= MAX_REASON_LEN {
        return;
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_conversion() {
        for raw in [1000u16, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 1012, 1013] {
            assert_eq!(u16::from(CloseCode::from(raw)), raw);
            assert!(CloseCode::from(raw).is_allowed());
        }
        assert_eq!(CloseCode::from(3001), CloseCode::Iana(3001));
        assert_eq!(CloseCode::from(4404), CloseCode::Library(4404));
        assert_eq!(u16::from(CloseCode::Library(4404)), 4404);
    }

    #[test]
    fn test_codes_not_allowed_on_wire() {
        for raw in [0u16, 999, 1004, 1005, 1006, 1014, 1015, 1016, 2999, 5000] {
            assert!(!CloseCode::from(raw).is_allowed(), "{raw}");
        }
    }

    #[test]
    fn test_parse_and_encode() {
        let frame = CloseFrame::new(CloseCode::Normal, "bye");
        let payload = frame.to_payload();
        assert_eq!(&payload[..], b"\x03\xe8bye");
        assert_eq!(CloseFrame::parse(&payload).unwrap(), Some(frame));
    }

    #[test]
    fn test_parse_edge_cases() {
        assert_eq!(CloseFrame::parse(&[]).unwrap(), None);
        assert!(matches!(
            CloseFrame::parse(&[0x03]),
            Err(WebSocketError::InvalidCloseFrame)
        ));
        assert!(matches!(
            CloseFrame::parse(&1006u16.to_be_bytes()),
            Err(WebSocketError::InvalidCloseCode)
        ));
        assert!(matches!(
            CloseFrame::parse(b"\x03\xe8\xff\xfe"),
            Err(WebSocketError::InvalidUTF8)
        ));
    }

    #[test]
    fn test_reason_truncated_on_char_boundary() {
        // 'é' is two bytes, so 62 of them is 124 bytes and the last one cannot fit
        let reason = "é".repeat(62);
        let frame = CloseFrame::new(CloseCode::Away, reason);
        assert_eq!(frame.reason.len(), 122);
        assert!(frame.to_payload().len() <= 125);

        let ascii = CloseFrame::new(CloseCode::Away, "x".repeat(200));
        assert_eq!(ascii.reason.len(), MAX_REASON_LEN);
    }
}
