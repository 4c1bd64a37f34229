//! Raw DEFLATE for permessage-deflate payloads, [RFC 7692 Section 7.2](https://datatracker.ietf.org/doc/html/rfc7692#section-7.2).
//!
//! A compressed message is the output of a sync flush with the trailing `00 00 ff ff` removed.
//! The receiver appends those four bytes back before inflating.
//!
//! With context takeover the LZ77 window carries over from one message to the next. Without it
//! both sides reset their state after every message.
use bytes::BytesMut;
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};

use crate::{Result, WebSocketError};

pub use flate2::Compression as CompressionLevel;

/// Tail of every sync flush, omitted on the wire.
const SYNC_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Spare output space guaranteed before each deflate/inflate call.
const MIN_SPARE: usize = 64;

fn deflate_error(err: impl std::fmt::Display) -> WebSocketError {
    WebSocketError::Compression(err.to_string())
}

/// Compresses outgoing messages.
pub struct Deflater {
    compress: Compress,
    no_context_takeover: bool,
}

impl Deflater {
    /// Creates a compressor.
    ///
    /// # Parameters
    /// - `level`: Compression level.
    /// - `window_bits`: LZ77 window size. Only honoured with the `zlib` feature, where 8 is
    ///   raised to 9 because zlib's raw deflate has no 256-byte window.
    /// - `no_context_takeover`: Reset the compressor after every message.
    pub fn new(
        level: CompressionLevel,
        window_bits: Option<u8>,
        no_context_takeover: bool,
    ) -> Self {
        #[cfg(feature = "zlib")]
        let compress = match window_bits {
            Some(bits) => Compress::new_with_window_bits(level, false, bits.clamp(9, 15)),
            None => Compress::new(level, false),
        };
        #[cfg(not(feature = "zlib"))]
        let compress = {
            let _ = window_bits;
            Compress::new(level, false)
        };

        Self {
            compress,
            no_context_takeover,
        }
    }

    /// Compresses one whole message.
    pub fn compress(&mut self, mut input: &[u8]) -> Result<BytesMut> {
        let mut out = Vec::with_capacity(input.len() / 2 + MIN_SPARE);

        loop {
            if out.capacity() - out.len() < MIN_SPARE {
                out.reserve(out.capacity().max(MIN_SPARE));
            }

            let before = self.compress.total_in();
            let status = self
                .compress
                .compress_vec(input, &mut out, FlushCompress::Sync)
                .map_err(deflate_error)?;
            input = &input[(self.compress.total_in() - before) as usize..];

            // the flush is complete once zlib stops short of filling the buffer
            let flushed = input.is_empty() && out.len() < out.capacity();
            match status {
                Status::Ok | Status::BufError if flushed => break,
                Status::Ok | Status::BufError => {}
                Status::StreamEnd => return Err(deflate_error("unexpected end of deflate stream")),
            }
        }

        if out.ends_with(&SYNC_TRAILER) {
            out.truncate(out.len() - SYNC_TRAILER.len());
        }
        if self.no_context_takeover {
            self.compress.reset();
        }

        Ok(BytesMut::from(&out[..]))
    }
}

/// Decompresses incoming messages.
pub struct Inflater {
    decompress: Decompress,
    no_context_takeover: bool,
    max_output: usize,
}

impl Inflater {
    /// Creates a decompressor refusing to produce more than `max_output` bytes per message.
    pub fn new(window_bits: Option<u8>, no_context_takeover: bool, max_output: usize) -> Self {
        #[cfg(feature = "zlib")]
        let decompress = match window_bits {
            Some(bits) => Decompress::new_with_window_bits(false, bits.clamp(9, 15)),
            None => Decompress::new(false),
        };
        #[cfg(not(feature = "zlib"))]
        let decompress = {
            let _ = window_bits;
            Decompress::new(false)
        };

        Self {
            decompress,
            no_context_takeover,
            max_output,
        }
    }

    /// Inflates one whole message.
    ///
    /// # Errors
    /// - [`WebSocketError::FrameTooLarge`] if the output exceeds the configured maximum.
    /// - [`WebSocketError::Compression`] for a corrupt stream.
    pub fn decompress(&mut self, input: &[u8]) -> Result<BytesMut> {
        let mut data = Vec::with_capacity(input.len() + SYNC_TRAILER.len());
        data.extend_from_slice(input);
        data.extend_from_slice(&SYNC_TRAILER);

        let initial = (input.len() * 2).clamp(MIN_SPARE, self.max_output.max(MIN_SPARE));
        let mut out = Vec::with_capacity(initial);
        let mut offset = 0;

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(MIN_SPARE));
            }

            let before_in = self.decompress.total_in();
            let before_out = out.len();
            let status = self
                .decompress
                .decompress_vec(&data[offset..], &mut out, FlushDecompress::Sync)
                .map_err(deflate_error)?;
            offset += (self.decompress.total_in() - before_in) as usize;

            if out.len() > self.max_output {
                return Err(WebSocketError::FrameTooLarge);
            }

            let drained = offset == data.len();
            match status {
                Status::StreamEnd => break,
                Status::Ok if drained && out.len() < out.capacity() => break,
                Status::Ok => {}
                Status::BufError if drained => break,
                Status::BufError => {
                    if out.len() == before_out && out.len() < out.capacity() {
                        return Err(deflate_error("corrupt deflate stream"));
                    }
                }
            }
        }

        if self.no_context_takeover {
            self.decompress.reset(false);
        }

        Ok(BytesMut::from(&out[..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_context_takeover() {
        let mut deflater = Deflater::new(CompressionLevel::default(), None, false);
        let mut inflater = Inflater::new(None, false, 1 << 20);

        let message = b"a fairly repetitive message, a fairly repetitive message".repeat(8);
        let first = deflater.compress(&message).unwrap();
        let second = deflater.compress(&message).unwrap();
        // the second copy refers back into the shared window
        assert!(second.len() < first.len());

        assert_eq!(&inflater.decompress(&first).unwrap()[..], &message[..]);
        assert_eq!(&inflater.decompress(&second).unwrap()[..], &message[..]);
    }

    #[test]
    fn test_no_context_takeover_resets_between_messages() {
        let mut deflater = Deflater::new(CompressionLevel::default(), None, true);
        let message = b"hello hello hello hello".to_vec();
        let first = deflater.compress(&message).unwrap();
        let second = deflater.compress(&message).unwrap();
        assert_eq!(first, second);

        // a fresh inflater per message must work
        for compressed in [first, second] {
            let mut inflater = Inflater::new(None, true, 1024);
            assert_eq!(&inflater.decompress(&compressed).unwrap()[..], &message[..]);
        }
    }

    #[test]
    fn test_trailer_is_stripped() {
        let mut deflater = Deflater::new(CompressionLevel::fast(), None, false);
        let compressed = deflater.compress(b"Hello").unwrap();
        assert!(!compressed.ends_with(&SYNC_TRAILER));
    }

    #[test]
    fn test_empty_and_large_messages() {
        let mut deflater = Deflater::new(CompressionLevel::default(), None, false);
        let mut inflater = Inflater::new(None, false, 1 << 22);

        let empty = deflater.compress(b"").unwrap();
        assert!(inflater.decompress(&empty).unwrap().is_empty());

        let large: Vec<u8> = (0..300_000u32).map(|i| (i % 97) as u8).collect();
        let compressed = deflater.compress(&large).unwrap();
        assert_eq!(&inflater.decompress(&compressed).unwrap()[..], &large[..]);
    }

    #[test]
    fn test_output_limit() {
        let mut deflater = Deflater::new(CompressionLevel::default(), None, false);
        let mut inflater = Inflater::new(None, false, 1000);
        let compressed = deflater.compress(&vec![0u8; 10_000]).unwrap();
        assert!(matches!(
            inflater.decompress(&compressed),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_corrupt_input() {
        let mut inflater = Inflater::new(None, false, 1024);
        assert!(inflater.decompress(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
