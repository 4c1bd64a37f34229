//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! [`FrameHeader`] is the decoded form of everything before the payload. It only lives while a
//! frame is being encoded or decoded. [`Frame`] is what the rest of the crate passes around:
//! the header bits that matter after decoding plus an already unmasked payload.
//!
//! Control frames (close, ping, pong) carry at most [`MAX_CONTROL_PAYLOAD`] bytes and always
//! have FIN set.
use bytes::{BufMut, BytesMut};

use crate::{
    close::{CloseCode, CloseFrame},
    WebSocketError,
};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible header: 2 fixed bytes, a 64-bit length and a masking key.
pub const MAX_HEAD_SIZE: usize = 14;

/// Operation code of a frame.
///
/// Values 0x3-0x7 and 0xB-0xF are reserved and rejected while decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Continuation`, `Text` and `Binary`.
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Number of bytes the payload length occupies on the wire, including the 7-bit field.
///
/// # Returns
/// - `1` for lengths below 126.
/// - `3` for lengths below 65536 (marker 126 plus 16 bits).
/// - `9` otherwise (marker 127 plus 64 bits).
#[inline]
pub fn length_field_size(payload_len: u64) -> usize {
    if payload_len < 126 {
        1
    } else if payload_len < 65536 {
        3
    } else {
        9
    }
}

/// Everything in a frame that precedes the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    /// Masking key, present iff the MASK bit is set.
    pub mask: Option<[u8; 4]>,
    /// Payload length, always below 2^63.
    pub payload_len: u64,
}

impl FrameHeader {
    /// The reserved bits in their byte-0 positions (0x40, 0x20, 0x10).
    #[inline]
    pub fn rsv_bits(&self) -> u8 {
        (self.rsv1 as u8) << 6 | (self.rsv2 as u8) << 5 | (self.rsv3 as u8) << 4
    }

    /// Size of the encoded header in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        1 + length_field_size(self.payload_len) + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Headers are never empty; present for API symmetry with [`len`](Self::len).
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Appends the header bytes to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.len());
        dst.put_u8((self.fin as u8) << 7 | self.rsv_bits() | u8::from(self.opcode));

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        match length_field_size(self.payload_len) {
            1 => dst.put_u8(mask_bit | self.payload_len as u8),
            3 => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(self.payload_len as u16);
            }
            _ => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(self.payload_len);
            }
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}

/// A decoded frame or a frame about to be encoded.
///
/// The payload is never masked here: the decoder unmasks while copying out of the receive
/// buffer and the encoder masks while copying into the send buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame of a message.
    pub fin: bool,
    pub opcode: OpCode,
    /// RSV1, set on the first frame of a compressed message.
    pub is_compressed: bool,
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new frame.
    ///
    /// # Parameters
    /// - `fin`: Whether this frame is the final fragment of a message.
    /// - `opcode`: The type of the frame.
    /// - `payload`: The unmasked payload.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            opcode,
            is_compressed: false,
            payload: payload.into(),
        }
    }

    /// Like [`Frame::new`], with RSV1 set to mark a compressed payload.
    pub fn compressed(fin: bool, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            is_compressed: true,
            ..Self::new(fin, opcode, payload)
        }
    }

    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, payload.as_ref())
    }

    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, payload.as_ref())
    }

    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, payload.as_ref())
    }

    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, payload.as_ref())
    }

    /// A close frame with a status code and a reason, cut to fit the control frame limit.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::close_frame(&CloseFrame::new(code, reason))
    }

    /// The close frame for an already built [`CloseFrame`].
    pub fn close_frame(close: &CloseFrame) -> Self {
        Self::new(true, OpCode::Close, close.to_payload())
    }

    /// A close frame with an arbitrary payload. Nothing is validated.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, payload.as_ref())
    }

    /// Whether the payload is valid UTF-8.
    #[inline]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// The header this frame is written with, given an optional masking key.
    pub fn header(&self, mask: Option<[u8; 4]>) -> FrameHeader {
        FrameHeader {
            fin: self.fin,
            rsv1: self.is_compressed,
            rsv2: false,
            rsv3: false,
            opcode: self.opcode,
            mask,
            payload_len: self.payload.len() as u64,
        }
    }
}
