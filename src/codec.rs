//! # Codec
//!
//! Encoding and decoding of single frames.
//!
//! The decoder works on a borrowed byte slice and never consumes anything itself: a successful
//! decode reports the frame together with `frame_len`, the exact number of bytes the frame
//! occupied, and the caller drops exactly that many bytes from its receive buffer. Running out
//! of bytes is not an error, [`Decoder::decode`] returns `Ok(None)` until the whole frame is
//! buffered.
//!
//! [`Codec`] wraps both halves for use with `tokio_util::codec::Framed`.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, FrameHeader, OpCode, MAX_CONTROL_PAYLOAD},
    mask::{apply_mask, mask_into, MaskGenerator},
    Result, WebSocketError,
};

/// Which end of the connection a codec runs on. Clients mask, servers don't.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Parses the header at the start of `buf`.
///
/// # Returns
/// - `Ok(None)` while fewer bytes than the header needs are buffered.
/// - `Ok(Some(header))` once the fixed bytes, the extended length and the masking key are all
///   present.
///
/// # Errors
/// - [`WebSocketError::InvalidOpCode`] for a reserved opcode.
/// - [`WebSocketError::FrameTooLarge`] when the most significant bit of a 64-bit length is set.
pub fn try_decode_header(buf: &[u8]) -> Result<Option<FrameHeader>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];
    let opcode = OpCode::try_from(b0 & 0x0F)?;
    let masked = b1 & 0x80 != 0;

    let extra = match b1 & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let needed = 2 + extra + if masked { 4 } else { 0 };
    if buf.len() < needed {
        return Ok(None);
    }

    let mut rest = &buf[2..needed];
    let payload_len = match extra {
        0 => u64::from(b1 & 0x7F),
        2 => u64::from(rest.get_u16()),
        _ => {
            let len = rest.get_u64();
            if len >> 63 != 0 {
                return Err(WebSocketError::FrameTooLarge);
            }
            len
        }
    };
    let mask = if masked {
        Some(rest.get_u32().to_be_bytes())
    } else {
        None
    };

    Ok(Some(FrameHeader {
        fin: b0 & 0x80 != 0,
        rsv1: b0 & 0x40 != 0,
        rsv2: b0 & 0x20 != 0,
        rsv3: b0 & 0x10 != 0,
        opcode,
        mask,
        payload_len,
    }))
}

/// A frame fresh off the wire plus the number of bytes it occupied.
#[derive(Debug)]
pub struct Decoded {
    pub frame: Frame,
    /// Header length plus payload length. The caller must drop exactly this many bytes.
    pub frame_len: usize,
}

/// Frame decoder for one end of a connection.
///
/// `Decoder` validates each header against the connection's role, the payload limit and the
/// reserved bits negotiated extensions are allowed to use.
#[derive(Debug, Clone)]
pub struct Decoder {
    role: Role,
    max_payload: usize,
    /// RSV bits in byte-0 positions that negotiated extensions claim.
    allowed_rsv: u8,
}

impl Decoder {
    /// Creates a decoder for `role` rejecting payloads larger than `max_payload` bytes.
    ///
    /// No reserved bits are allowed until [`Decoder::set_allowed_rsv`] is called.
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self {
            role,
            max_payload,
            allowed_rsv: 0,
        }
    }

    /// Sets the reserved bits frames may carry, as a byte-0 mask (RSV1 = 0x40).
    pub fn set_allowed_rsv(&mut self, mask: u8) {
        self.allowed_rsv = mask & 0x70;
    }

    /// The role this decoder checks masking against.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Validates a header against the protocol rules that do not depend on earlier frames.
    pub fn check(&self, header: &FrameHeader) -> Result<()> {
        if header.rsv_bits() & !self.allowed_rsv != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }
        // extensions only mark the first frame of a data message
        if header.rsv1 && (header.opcode.is_control() || header.opcode == OpCode::Continuation) {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        if header.opcode.is_control() {
            if !header.fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(WebSocketError::ControlFrameTooLarge(
                    header.payload_len as usize,
                ));
            }
        }

        match (self.role, header.mask.is_some()) {
            (Role::Server, false) => return Err(WebSocketError::UnmaskedFrame),
            (Role::Client, true) => return Err(WebSocketError::UnexpectedMask),
            _ => {}
        }

        if header.payload_len > self.max_payload as u64 {
            return Err(WebSocketError::FrameTooLarge);
        }

        Ok(())
    }

    /// Decodes the frame at the start of `buf`.
    ///
    /// # Returns
    /// - `Ok(Some(decoded))` with the unmasked frame and its wire length.
    /// - `Ok(None)` if the frame is not completely buffered yet. The header is still checked
    ///   as soon as it is available, so an oversized frame fails before its payload arrives.
    /// - `Err(WebSocketError)` on a protocol violation.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<Decoded>> {
        let Some(header) = try_decode_header(buf)? else {
            return Ok(None);
        };
        self.check(&header)?;

        // check() bounds payload_len by max_payload, a usize
        let frame_len = header.len() + header.payload_len as usize;
        if buf.len() < frame_len {
            return Ok(None);
        }

        let mut payload = BytesMut::from(&buf[header.len()..frame_len]);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Decoded {
            frame: Frame {
                fin: header.fin,
                opcode: header.opcode,
                is_compressed: header.rsv1,
                payload,
            },
            frame_len,
        }))
    }
}

/// Frame encoder for one end of a connection.
///
/// Client encoders draw a fresh masking key per frame from their own [`MaskGenerator`].
#[derive(Debug)]
pub struct Encoder {
    role: Role,
    masks: MaskGenerator,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self::with_mask_generator(role, MaskGenerator::from_entropy())
    }

    /// Creates an encoder drawing masking keys from `masks`.
    pub fn with_mask_generator(role: Role, masks: MaskGenerator) -> Self {
        Self { role, masks }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Appends the wire form of `frame` to `dst`.
    ///
    /// # Errors
    /// - [`WebSocketError::ControlFrameTooLarge`] for a control payload over 125 bytes.
    /// - [`WebSocketError::ControlFrameFragmented`] for a control frame without FIN.
    ///
    /// Nothing is written when an error is returned.
    pub fn encode_frame(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.opcode.is_control() {
            if frame.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge(frame.payload.len()));
            }
            if !frame.fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
        }

        let mask = match self.role {
            Role::Client => Some(self.masks.next_key()),
            Role::Server => None,
        };
        let header = frame.header(mask);
        dst.reserve(header.len() + frame.payload.len());
        header.encode(dst);

        match mask {
            Some(key) => {
                let start = dst.len();
                dst.put_bytes(0, frame.payload.len());
                mask_into(&mut dst[start..], &frame.payload, key);
            }
            None => dst.extend_from_slice(&frame.payload),
        }

        Ok(())
    }
}

/// A combined decoder and encoder usable with `tokio_util::codec::Framed`.
#[derive(Debug)]
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self {
            decoder: Decoder::new(role, max_payload),
            encoder: Encoder::new(role),
        }
    }

    /// Allows frames to carry the reserved bits in `mask`.
    pub fn set_allowed_rsv(&mut self, mask: u8) {
        self.decoder.set_allowed_rsv(mask);
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decoder.decode(&src[..])? {
            Some(decoded) => {
                src.advance(decoded.frame_len);
                Ok(Some(decoded.frame))
            }
            None => Ok(None),
        }
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = WebSocketError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        self.encoder.encode_frame(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::CloseCode;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    fn client_encoder() -> Encoder {
        Encoder::with_mask_generator(Role::Client, MaskGenerator::seeded(42))
    }

    fn encode(encoder: &mut Encoder, frame: &Frame) -> BytesMut {
        let mut dst = BytesMut::new();
        encoder.encode_frame(frame, &mut dst).unwrap();
        dst
    }

    #[test]
    fn test_client_to_server_round_trip() {
        let mut encoder = client_encoder();
        let decoder = Decoder::new(Role::Server, 1 << 20);
        for len in [0usize, 1, 125, 126, 127, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let wire = encode(&mut encoder, &Frame::binary(&payload));
            let decoded = decoder.decode(&wire).unwrap().unwrap();
            assert_eq!(decoded.frame_len, wire.len());
            assert_eq!(&decoded.frame.payload[..], &payload[..]);
        }
    }

    #[test]
    fn test_server_frames_are_not_masked() {
        let mut encoder = Encoder::new(Role::Server);
        let wire = encode(&mut encoder, &Frame::text("Hello"));
        assert_eq!(&wire[..], b"\x81\x05Hello");
    }

    #[test]
    fn test_client_frames_are_masked_on_the_wire() {
        let mut encoder = client_encoder();
        let wire = encode(&mut encoder, &Frame::text("Hello"));
        assert_eq!(wire[1], 0x80 | 5);
        let key = [wire[2], wire[3], wire[4], wire[5]];
        let mut body = wire[6..].to_vec();
        apply_mask(&mut body, key);
        assert_eq!(body, b"Hello");
    }

    #[test]
    fn test_partial_input_needs_more_bytes() {
        let mut encoder = client_encoder();
        let wire = encode(&mut encoder, &Frame::binary(vec![7u8; 300]));
        let decoder = Decoder::new(Role::Server, 1 << 20);
        for cut in [0, 1, 2, 3, 4, 7, 8, wire.len() - 1] {
            assert!(decoder.decode(&wire[..cut]).unwrap().is_none(), "cut {cut}");
        }
        assert!(decoder.decode(&wire).unwrap().is_some());
    }

    #[test]
    fn test_frame_len_with_trailing_bytes() {
        let mut encoder = Encoder::new(Role::Server);
        let mut wire = encode(&mut encoder, &Frame::text("one"));
        let first = wire.len();
        encoder
            .encode_frame(&Frame::text("two"), &mut wire)
            .unwrap();

        let decoder = Decoder::new(Role::Client, 1024);
        let decoded = decoder.decode(&wire).unwrap().unwrap();
        assert_eq!(decoded.frame_len, first);
        assert_eq!(&decoded.frame.payload[..], b"one");
    }

    #[test]
    fn test_control_frame_limits_on_encode() {
        let mut encoder = Encoder::new(Role::Server);
        let mut dst = BytesMut::new();
        encoder
            .encode_frame(&Frame::ping(vec![0u8; 125]), &mut dst)
            .unwrap();

        let mut dst = BytesMut::new();
        assert!(matches!(
            encoder.encode_frame(&Frame::pong(vec![0u8; 126]), &mut dst),
            Err(WebSocketError::ControlFrameTooLarge(126))
        ));
        assert!(dst.is_empty());
        assert!(matches!(
            encoder.encode_frame(&Frame::close_raw(vec![0u8; 126]), &mut dst),
            Err(WebSocketError::ControlFrameTooLarge(126))
        ));
        assert!(matches!(
            encoder.encode_frame(&Frame::new(false, OpCode::Ping, "x"), &mut dst),
            Err(WebSocketError::ControlFrameFragmented)
        ));
    }

    #[test]
    fn test_control_frame_limits_on_decode() {
        let decoder = Decoder::new(Role::Client, 1024);
        // ping with a 16-bit length of 126
        let wire = [0x89, 126, 0x00, 0x7E];
        assert!(matches!(
            decoder.decode(&wire),
            Err(WebSocketError::ControlFrameTooLarge(126))
        ));
        // close without FIN
        assert!(matches!(
            decoder.decode(&[0x08, 0x00]),
            Err(WebSocketError::ControlFrameFragmented)
        ));
    }

    #[test]
    fn test_reserved_bits_require_negotiation() {
        let mut decoder = Decoder::new(Role::Client, 1024);
        let wire = [0xC1, 0x01, b'x'];
        assert!(matches!(
            decoder.decode(&wire),
            Err(WebSocketError::ReservedBitsNotZero)
        ));

        decoder.set_allowed_rsv(0x40);
        let decoded = decoder.decode(&wire).unwrap().unwrap();
        assert!(decoded.frame.is_compressed);

        // RSV2 is never claimed
        assert!(matches!(
            decoder.decode(&[0xA1, 0x00]),
            Err(WebSocketError::ReservedBitsNotZero)
        ));
        // RSV1 on a continuation or control frame
        assert!(decoder.decode(&[0xC0, 0x00]).is_err());
        assert!(decoder.decode(&[0xC9, 0x00]).is_err());
    }

    #[test]
    fn test_masking_rules_by_role() {
        let server = Decoder::new(Role::Server, 1024);
        assert!(matches!(
            server.decode(b"\x81\x02hi"),
            Err(WebSocketError::UnmaskedFrame)
        ));

        let client = Decoder::new(Role::Client, 1024);
        let wire = encode(&mut client_encoder(), &Frame::text("hi"));
        assert!(matches!(
            client.decode(&wire),
            Err(WebSocketError::UnexpectedMask)
        ));
    }

    #[test]
    fn test_reserved_opcode_and_oversized_payload() {
        let decoder = Decoder::new(Role::Client, 16);
        assert!(matches!(
            decoder.decode(&[0x83, 0x00]),
            Err(WebSocketError::InvalidOpCode(3))
        ));
        // header alone is enough to reject
        assert!(matches!(
            decoder.decode(&[0x82, 17]),
            Err(WebSocketError::FrameTooLarge)
        ));
        let mut huge = vec![0x82, 127];
        huge.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert!(matches!(
            try_decode_header(&huge),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_tokio_codec_advances_by_frame_len() {
        let mut server = Codec::new(Role::Server, 1024);
        let mut client = Codec::new(Role::Client, 1024);

        let mut wire = BytesMut::new();
        client.encode(Frame::text("first"), &mut wire).unwrap();
        client
            .encode(Frame::close(CloseCode::Normal, "done"), &mut wire)
            .unwrap();
        wire.extend_from_slice(&[0x81]);

        let first = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(&first.payload[..], b"first");
        let close = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(close.opcode, OpCode::Close);
        assert!(server.decode(&mut wire).unwrap().is_none());
        assert_eq!(wire.len(), 1);
    }
}
