use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::pool::BufferPool;

pub use crate::compression::CompressionLevel;

/// Default maximum payload of a single incoming frame: 1 MiB.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Default maximum size of a reassembled (and decompressed) incoming message: 2 MiB.
pub const MAX_READ_BUFFER: usize = 2 * 1024 * 1024;

/// Default time to wait for traffic after a keep-alive ping.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for the peer's close frame after sending ours.
pub const CLOSING_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on the whole opening handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration of a WebSocket connection.
///
/// Every field has a sensible default; the `with_*` methods are the usual way to change them.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use sockweave::{CompressionLevel, Options};
///
/// let options = Options::default()
///     .with_compression_level(CompressionLevel::fast())
///     .with_keep_alive(Duration::from_secs(30), Duration::from_secs(5))
///     .with_protocols(["chat"]);
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum payload of a single incoming frame.
    ///
    /// A larger frame is a protocol violation closed with 1009 (message too big).
    ///
    /// Default: [`MAX_PAYLOAD_READ`].
    pub max_payload_read: Option<usize>,

    /// Maximum size of a whole incoming message, after reassembly and decompression.
    ///
    /// Default: twice `max_payload_read` if that is set, [`MAX_READ_BUFFER`] otherwise.
    pub max_read_buffer: Option<usize>,

    /// Compression settings. `None` disables permessage-deflate.
    pub compression: Option<DeflateOptions>,

    /// Idle time after which a ping is sent. `None` disables keep-alive.
    pub keep_alive_interval: Option<Duration>,

    /// How long to wait for any traffic after a keep-alive ping before closing with 1006.
    pub keep_alive_timeout: Duration,

    /// How long to wait for the peer's close frame after sending ours.
    pub closing_timeout: Duration,

    /// Bound on the opening handshake.
    pub handshake_timeout: Duration,

    /// Outgoing data messages larger than this are split into fragments.
    pub fragment_size: Option<usize>,

    /// Subprotocols offered by a client or supported by a server, in order of preference.
    pub protocols: Vec<String>,

    /// `Origin` header sent by a client.
    pub origin: Option<String>,

    /// Cookies sent by a client.
    pub cookies: Vec<(String, String)>,

    /// Pool the connection borrows its receive buffers from. A private pool is created when
    /// none is given.
    pub buffer_pool: Option<Arc<BufferPool>>,

    /// Cancelling this token stops the connection: the receive loop exits and the transport is
    /// closed.
    pub cancellation: Option<CancellationToken>,

    /// Sets `TCP_NODELAY` on sockets this crate opens itself.
    pub no_delay: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: None,
            max_read_buffer: None,
            compression: None,
            keep_alive_interval: None,
            keep_alive_timeout: KEEP_ALIVE_TIMEOUT,
            closing_timeout: CLOSING_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            fragment_size: None,
            protocols: Vec::new(),
            origin: None,
            cookies: Vec::new(),
            buffer_pool: None,
            cancellation: None,
            no_delay: true,
        }
    }
}

/// Configuration of the permessage-deflate extension ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)).
///
/// # Context takeover
/// By default both sides keep their LZ77 window from one message to the next, which compresses
/// similar messages much better. The `*_no_context_takeover` flags reset the window after every
/// message instead, keeping memory use flat.
///
/// # Window size
/// The `*_max_window_bits` values (8 to 15) size the zlib window when the crate is built with
/// the `zlib` feature. Without it every window is 15 bits: a server configured (or asked) for a
/// smaller `server_max_window_bits` declines the extension and the connection runs
/// uncompressed, and a client never offers a smaller `client_max_window_bits`.
///
/// # Example
/// ```
/// use sockweave::{CompressionLevel, DeflateOptions};
///
/// let opts = DeflateOptions {
///     level: CompressionLevel::default(),
///     server_no_context_takeover: true,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, Default)]
pub struct DeflateOptions {
    /// Compression level, 0 (none) to 9 (best).
    pub level: CompressionLevel,

    /// Window the server compresses with.
    pub server_max_window_bits: Option<u8>,

    /// Window the client compresses with.
    pub client_max_window_bits: Option<u8>,

    /// Reset the server's compressor after every message.
    pub server_no_context_takeover: bool,

    /// Reset the client's compressor after every message.
    pub client_no_context_takeover: bool,
}

impl Options {
    /// Resolved per-frame payload limit.
    pub fn max_payload(&self) -> usize {
        self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ)
    }

    /// Resolved per-message limit.
    pub fn max_message(&self) -> usize {
        // at least twice the payload read if not specified
        self.max_read_buffer.unwrap_or(
            self.max_payload_read
                .map(|payload_read| payload_read.saturating_mul(2))
                .unwrap_or(MAX_READ_BUFFER),
        )
    }

    /// Enables compression with the given level.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.level = level;

        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables compression.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Sets the maximum payload of a single incoming frame.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of a whole incoming message.
    pub fn with_max_read_buffer(self, size: usize) -> Self {
        Self {
            max_read_buffer: Some(size),
            ..self
        }
    }

    /// Limits the window the client compresses with, enabling compression if needed.
    pub fn with_client_max_window_bits(self, max_window_bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_max_window_bits = Some(max_window_bits);
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Limits the window the server compresses with, enabling compression if needed.
    pub fn with_server_max_window_bits(self, max_window_bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_max_window_bits = Some(max_window_bits);
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables context takeover for the server's compressor.
    pub fn server_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables context takeover for the client's compressor.
    pub fn client_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sends a ping after `interval` without traffic, and closes the connection if nothing
    /// arrives within `timeout` after it.
    pub fn with_keep_alive(self, interval: Duration, timeout: Duration) -> Self {
        Self {
            keep_alive_interval: Some(interval),
            keep_alive_timeout: timeout,
            ..self
        }
    }

    pub fn with_closing_timeout(self, timeout: Duration) -> Self {
        Self {
            closing_timeout: timeout,
            ..self
        }
    }

    pub fn with_handshake_timeout(self, timeout: Duration) -> Self {
        Self {
            handshake_timeout: timeout,
            ..self
        }
    }

    /// Splits outgoing data messages into fragments of at most `size` bytes.
    pub fn with_fragment_size(self, size: usize) -> Self {
        Self {
            fragment_size: Some(size),
            ..self
        }
    }

    /// Subprotocols to offer (client) or accept (server), most preferred first.
    pub fn with_protocols(self, protocols: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_origin(self, origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..self
        }
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Shares `pool` with other connections.
    pub fn with_buffer_pool(self, pool: Arc<BufferPool>) -> Self {
        Self {
            buffer_pool: Some(pool),
            ..self
        }
    }

    /// Stops the connection when `token` is cancelled.
    pub fn with_cancellation(self, token: CancellationToken) -> Self {
        Self {
            cancellation: Some(token),
            ..self
        }
    }

    pub fn with_no_delay(self, no_delay: bool) -> Self {
        Self { no_delay, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits() {
        let options = Options::default();
        assert_eq!(options.max_payload(), MAX_PAYLOAD_READ);
        assert_eq!(options.max_message(), MAX_READ_BUFFER);

        let options = Options::default().with_max_payload_read(100);
        assert_eq!(options.max_message(), 200);

        let options = options.with_max_read_buffer(150);
        assert_eq!(options.max_message(), 150);
    }

    #[test]
    fn test_compression_builders() {
        let options = Options::default().client_no_context_takeover();
        let compression = options.compression.clone().unwrap();
        assert!(compression.client_no_context_takeover);
        assert!(!compression.server_no_context_takeover);

        let options = options.with_server_max_window_bits(10).without_compression();
        assert!(options.compression.is_none());
    }
}
