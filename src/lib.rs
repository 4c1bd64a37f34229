//! # sockweave
//! Socket transport building blocks and an implementation of the WebSocket protocol (RFC 6455)
//! with permessage-deflate negotiation (RFC 7692).
//!
//! The crate is organised around the path raw bytes take through a connection:
//!
//! - [`pool::BufferPool`] lends fixed-size byte buffers so that reads and scratch copies don't
//!   allocate per message. A single pool can be shared by every connection of a server.
//! - [`session::SessionBuffer`] stitches partial TCP reads together until a whole frame is
//!   available, returning its pooled storage when it grows or is dropped.
//! - [`ring::CircularBuffer`] is the bounded ring buffer used for bulk streaming of byte data.
//! - [`codec`] encodes and decodes frames, including the 7/16/64-bit length forms and masking.
//! - [`handshake`] builds and validates the HTTP/1.1 upgrade exchange.
//! - [`extensions`] negotiates permessage-deflate and decides which RSV bits a connection may use.
//! - [`WebSocket`] drives a connection through its states, answers pings, runs the keep-alive
//!   timers and performs the closing handshake.
//!
//! # Features
//!
//! - `logging` (default): debug logging of negotiation, state transitions and timers through the
//!   `log` crate.
//! - `zlib`: honours negotiated `client_max_window_bits` / `server_max_window_bits` by sizing the
//!   zlib window. Without it only the default 15-bit window is available, so a server whose
//!   window would end up below 15 bits declines permessage-deflate and logs a warning.
//!
//! # Client Example
//! ```no_run
//! use sockweave::{Message, Options, WebSocket};
//!
//! async fn client() -> sockweave::Result<()> {
//!     let mut ws = WebSocket::connect("ws://127.0.0.1:9001/chat".parse()?, Options::default()).await?;
//!     ws.sender().send_text("hello").await?;
//!
//!     while let Ok(message) = ws.next_message().await {
//!         match message {
//!             Message::Text(text) => println!("{text}"),
//!             Message::Close(_) => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Server Example
//! ```no_run
//! use sockweave::{Message, Options, WebSocket};
//! use tokio::net::TcpListener;
//!
//! async fn server() -> sockweave::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:9001").await?;
//!     let (stream, _) = listener.accept().await?;
//!
//!     let mut ws = WebSocket::accept(stream, Options::default()).await?;
//!     let sender = ws.sender();
//!     while let Ok(message) = ws.next_message().await {
//!         match message {
//!             Message::Text(text) => sender.send_text(text).await?,
//!             Message::Binary(data) => sender.send_binary(data).await?,
//!             Message::Close(_) => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

mod compression;
mod native;

pub mod close;
pub mod codec;
pub mod extensions;
pub mod fragment;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod pool;
pub mod ring;
pub mod session;
pub mod state;

use thiserror::Error;

pub use close::{CloseCode, CloseFrame};
pub use extensions::NegotiationError;
pub use frame::{Frame, OpCode};
pub use handshake::HandshakeError;
pub use native::*;
pub use state::ConnectionState;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur while moving bytes through a connection.
///
/// The variants fall into a handful of families:
///
/// - Argument errors (`InvalidArgument`, `OutOfRange`): caller bugs, not recoverable.
/// - Capacity errors (`CapacityExceeded`): a buffer could not grow any further.
/// - Protocol violations: malformed or illegal frames. The connection is closed with the code
///   returned by [`WebSocketError::close_code`].
/// - Handshake errors: the connection never reaches [`ConnectionState::Open`].
/// - Transport errors (`IoError`): treated like an abnormal close by the peer.
///
/// Running out of buffered bytes while decoding is *not* an error; decoders return `Ok(None)`.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A caller passed a buffer or length the operation cannot accept.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A request reached past the valid region of a buffer.
    #[error("Out of range: requested {requested} but only {available} available")]
    OutOfRange { requested: usize, available: usize },

    /// A buffer or pool could not grow to hold the requested amount.
    #[error("Capacity exceeded: requested {requested}, limit {limit}")]
    CapacityExceeded { requested: usize, limit: usize },

    /// Occurs when receiving a data frame that starts a new message while the previous
    /// fragmented message is still incomplete.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Indicates that a text frame or close frame reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Indicates that a received close frame has an invalid format, such as
    /// containing a payload of 1 byte.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close frame carries a status code that may not be sent on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// Reserved bits are set that no negotiated extension claims.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame (ping, pong, or close) was sent or received with the FIN bit cleared.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carries more than 125 bytes of payload.
    #[error("Control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(usize),

    /// A frame or message is larger than the configured maximum.
    #[error("Frame too large")]
    FrameTooLarge,

    /// Receipt of a frame with a reserved opcode.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A server received a frame from the client without a masking key.
    #[error("Client frame is not masked")]
    UnmaskedFrame,

    /// A client received a masked frame from the server.
    #[error("Server frame must not be masked")]
    UnexpectedMask,

    /// A compressed frame arrived on a connection that did not negotiate compression.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// The compressed payload could not be inflated or deflated.
    #[error("Compression error: {0}")]
    Compression(String),

    /// The opening handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// An extension offer or response could not be agreed on.
    #[error(transparent)]
    Extension(#[from] NegotiationError),

    /// The connection is closed; no further communication is possible.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Only "ws://" URLs can be dialled directly.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// Wraps errors from URL parsing.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps I/O errors from the transport.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// Returns `true` for errors caused by a peer breaking the framing rules.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidFragment
                | Self::InvalidContinuationFrame
                | Self::InvalidUTF8
                | Self::InvalidCloseFrame
                | Self::InvalidCloseCode
                | Self::ReservedBitsNotZero
                | Self::ControlFrameFragmented
                | Self::ControlFrameTooLarge(_)
                | Self::FrameTooLarge
                | Self::InvalidOpCode(_)
                | Self::UnmaskedFrame
                | Self::UnexpectedMask
                | Self::CompressionNotSupported
                | Self::Compression(_)
        )
    }

    /// The close code sent to the peer when this error terminates a connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::FrameTooLarge | Self::CapacityExceeded { .. } => CloseCode::Size,
            Self::InvalidOpCode(_) => CloseCode::Unsupported,
            Self::InvalidUTF8 | Self::Compression(_) => CloseCode::Invalid,
            Self::IoError(_) | Self::ConnectionClosed => CloseCode::Abnormal,
            err if err.is_protocol_violation() => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }
}
