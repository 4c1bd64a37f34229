//! # Fragmentation
//!
//! A message may travel as several frames: the first carries the real opcode with FIN cleared,
//! the following ones are continuation frames, and the last has FIN set. Control frames may be
//! interleaved with those fragments, data frames may not.
//!
//! [`Reassembler`] turns incoming frames back into whole messages. [`fragment`] does the
//! opposite for the send path.
use bytes::BytesMut;

use crate::{
    frame::{Frame, OpCode},
    Result, WebSocketError,
};

/// The message a continuation sequence belongs to.
#[derive(Debug, Clone, Copy)]
struct Fragment {
    opcode: OpCode,
    is_compressed: bool,
}

/// Collects data frames until a message is complete.
///
/// Control frames are handed back untouched whether or not a message is in progress. Data
/// messages come back as a single frame with FIN set, the opcode of the first fragment and its
/// RSV1 flag, so a compressed message is inflated once, after reassembly.
#[derive(Debug)]
pub struct Reassembler {
    max_message: usize,
    fragment: Option<Fragment>,
    accumulated: BytesMut,
}

impl Reassembler {
    /// Creates a reassembler that rejects messages larger than `max_message` bytes.
    pub fn new(max_message: usize) -> Self {
        Self {
            max_message,
            fragment: None,
            accumulated: BytesMut::new(),
        }
    }

    /// Whether a fragmented message has been started but not finished.
    pub fn is_in_progress(&self) -> bool {
        self.fragment.is_some()
    }

    /// Payload bytes held for the message in progress.
    pub fn buffered(&self) -> usize {
        self.accumulated.len()
    }

    /// Drops a partially received message.
    pub fn reset(&mut self) {
        self.fragment = None;
        self.accumulated = BytesMut::new();
    }

    /// Feeds one decoded frame.
    ///
    /// # Returns
    /// - `Ok(Some(frame))` for a control frame or a completed data message.
    /// - `Ok(None)` while a fragmented message is still incomplete.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidFragment`] if a new data message starts before the previous
    ///   one finished.
    /// - [`WebSocketError::InvalidContinuationFrame`] for a continuation with nothing to continue.
    /// - [`WebSocketError::FrameTooLarge`] once the message would exceed the size limit.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Frame>> {
        match frame.opcode {
            OpCode::Close | OpCode::Ping | OpCode::Pong => Ok(Some(frame)),
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }
                if frame.payload.len() > self.max_message {
                    return Err(WebSocketError::FrameTooLarge);
                }
                if frame.fin {
                    return Ok(Some(frame));
                }

                self.fragment = Some(Fragment {
                    opcode: frame.opcode,
                    is_compressed: frame.is_compressed,
                });
                self.accumulated = frame.payload;
                Ok(None)
            }
            OpCode::Continuation => {
                let fragment = self
                    .fragment
                    .ok_or(WebSocketError::InvalidContinuationFrame)?;

                if self.accumulated.len() + frame.payload.len() > self.max_message {
                    self.reset();
                    return Err(WebSocketError::FrameTooLarge);
                }
                self.accumulated.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return Ok(None);
                }

                self.fragment = None;
                Ok(Some(Frame {
                    fin: true,
                    opcode: fragment.opcode,
                    is_compressed: fragment.is_compressed,
                    payload: std::mem::take(&mut self.accumulated),
                }))
            }
        }
    }
}

/// Splits a message payload into frames of at most `size` bytes.
///
/// The first frame carries `opcode` and the compression flag, the rest are continuation
/// frames, and only the last one has FIN set. An empty payload yields a single frame.
pub fn fragment(
    opcode: OpCode,
    payload: &[u8],
    size: usize,
    is_compressed: bool,
) -> Result<Vec<Frame>> {
    if size == 0 {
        return Err(WebSocketError::InvalidArgument("fragment size must be positive"));
    }
    if opcode.is_control() {
        return Err(WebSocketError::ControlFrameFragmented);
    }
    if opcode == OpCode::Continuation {
        return Err(WebSocketError::InvalidArgument(
            "a message must start with a text or binary frame",
        ));
    }

    if payload.len() <= size {
        let mut frame = Frame::new(true, opcode, payload);
        frame.is_compressed = is_compressed;
        return Ok(vec![frame]);
    }

    let count = payload.len().div_ceil(size);
    let frames = payload
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| Frame {
            fin: i + 1 == count,
            opcode: if i == 0 { opcode } else { OpCode::Continuation },
            is_compressed: i == 0 && is_compressed,
            payload: BytesMut::from(chunk),
        })
        .collect();
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_fragments_yield_one_message() {
        let mut reassembler = Reassembler::new(1024);
        let frames = [
            Frame::new(false, OpCode::Text, "hel"),
            Frame::new(false, OpCode::Continuation, "lo wo"),
            Frame::new(true, OpCode::Continuation, "rld"),
        ];

        let mut completed = Vec::new();
        for frame in frames {
            if let Some(message) = reassembler.push(frame).unwrap() {
                completed.push(message);
            }
        }

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].opcode, OpCode::Text);
        assert!(completed[0].fin);
        assert_eq!(&completed[0].payload[..], b"hello world");
        assert!(!reassembler.is_in_progress());
    }

    #[test]
    fn test_control_frames_interleave() {
        let mut reassembler = Reassembler::new(1024);
        assert!(reassembler
            .push(Frame::new(false, OpCode::Binary, &[1u8][..]))
            .unwrap()
            .is_none());

        let ping = reassembler.push(Frame::ping("p")).unwrap().unwrap();
        assert_eq!(ping.opcode, OpCode::Ping);
        assert!(reassembler.is_in_progress());

        let done = reassembler
            .push(Frame::new(true, OpCode::Continuation, &[2u8][..]))
            .unwrap()
            .unwrap();
        assert_eq!(&done.payload[..], &[1, 2]);
    }

    #[test]
    fn test_interleaved_data_message_is_rejected() {
        let mut reassembler = Reassembler::new(1024);
        reassembler
            .push(Frame::new(false, OpCode::Text, "a"))
            .unwrap();
        assert!(matches!(
            reassembler.push(Frame::text("b")),
            Err(WebSocketError::InvalidFragment)
        ));
    }

    #[test]
    fn test_orphan_continuation_is_rejected() {
        let mut reassembler = Reassembler::new(1024);
        assert!(matches!(
            reassembler.push(Frame::new(true, OpCode::Continuation, "x")),
            Err(WebSocketError::InvalidContinuationFrame)
        ));
    }

    #[test]
    fn test_message_size_limit() {
        let mut reassembler = Reassembler::new(4);
        reassembler
            .push(Frame::new(false, OpCode::Binary, "abc"))
            .unwrap();
        assert!(matches!(
            reassembler.push(Frame::new(true, OpCode::Continuation, "de")),
            Err(WebSocketError::FrameTooLarge)
        ));
        assert_eq!(reassembler.buffered(), 0);
        assert!(matches!(
            reassembler.push(Frame::binary("abcde")),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_compression_flag_follows_first_fragment() {
        let mut reassembler = Reassembler::new(64);
        let frames = fragment(OpCode::Binary, b"0123456789", 4, true).unwrap();
        assert!(frames[0].is_compressed);
        assert!(!frames[1].is_compressed);

        let mut message = None;
        for frame in frames {
            message = reassembler.push(frame).unwrap();
        }
        let message = message.unwrap();
        assert!(message.is_compressed);
        assert_eq!(&message.payload[..], b"0123456789");
    }

    #[test]
    fn test_fragment_layout() {
        let frames = fragment(OpCode::Text, b"hello world", 4, false).unwrap();
        let layout: Vec<_> = frames
            .iter()
            .map(|f| (f.fin, f.opcode, f.payload.len()))
            .collect();
        assert_eq!(
            layout,
            vec![
                (false, OpCode::Text, 4),
                (false, OpCode::Continuation, 4),
                (true, OpCode::Continuation, 3),
            ]
        );

        let single = fragment(OpCode::Binary, b"", 4, false).unwrap();
        assert_eq!(single.len(), 1);
        assert!(single[0].fin);

        assert!(fragment(OpCode::Text, b"x", 0, false).is_err());
        assert!(fragment(OpCode::Ping, b"x", 4, false).is_err());
        assert!(matches!(
            fragment(OpCode::Continuation, b"hello", 2, false),
            Err(WebSocketError::InvalidArgument(_))
        ));
    }
}
