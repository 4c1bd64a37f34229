//! WebSocket connections on the Tokio runtime.

mod keepalive;
mod options;
mod sender;

use std::{future::Future, io, panic::AssertUnwindSafe, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::{FutureExt, Stream};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf},
    net::TcpStream,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    close::{CloseCode, CloseFrame},
    codec::{Decoder, Role},
    extensions::{self, Inbound, NegotiatedExtensions, RSV1},
    fragment::Reassembler,
    frame::{Frame, OpCode},
    handshake::{self, ClientRequest, HandshakeError},
    pool::BufferPool,
    session::SessionBuffer,
    state::{ConnectionState, StateCell},
    Result, WebSocketError,
};

use keepalive::KeepAlive;
use sender::Shared;

// Re-exports
pub use options::{
    CompressionLevel, DeflateOptions, Options, CLOSING_TIMEOUT, HANDSHAKE_TIMEOUT,
    KEEP_ALIVE_TIMEOUT, MAX_PAYLOAD_READ, MAX_READ_BUFFER,
};
pub use sender::Sender;

/// A complete message, as delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message, always valid UTF-8.
    Text(String),
    Binary(Bytes),
    /// A ping from the peer. It has already been answered.
    Ping(Bytes),
    Pong(Bytes),
    /// The peer's close frame, `None` if it carried no status code. The connection is closed
    /// once this is delivered.
    Close(Option<CloseFrame>),
}

impl Message {
    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    /// The text of a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

/// Application callbacks driven by [`WebSocket::run`].
///
/// An error or a panic inside a callback is contained: it is logged, passed to
/// [`MessageHandler::on_error`] and the receive loop moves on to the next message.
pub trait MessageHandler<S>: Send {
    /// Called for every incoming message, including pings and the final close.
    fn on_message(
        &mut self,
        sender: &Sender<S>,
        message: Message,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Called when [`MessageHandler::on_message`] returned an error.
    fn on_error(&mut self, _err: &WebSocketError) {}
}

/// A pool buffer that goes back to its pool when dropped.
struct Scratch {
    pool: Arc<BufferPool>,
    buf: Option<BytesMut>,
}

impl Scratch {
    fn new(pool: Arc<BufferPool>) -> Result<Self> {
        let buf = pool.borrow()?;
        Ok(Self {
            pool,
            buf: Some(buf),
        })
    }

    fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    fn release(&mut self) {
        if let Some(buf) = self.buf.take() {
            let _ = self.pool.release(buf);
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.release();
    }
}

/// What the opening handshake leaves behind for the connection.
struct Parts {
    state: StateCell,
    recv: SessionBuffer,
    scratch: Scratch,
    extensions: NegotiatedExtensions,
    protocol: Option<String>,
}

enum Event {
    Read(io::Result<usize>),
    Cancelled,
    Closed,
}

/// A WebSocket connection over any byte stream.
///
/// The `WebSocket` value itself is the receive side: [`WebSocket::next_message`] reads,
/// reassembles and decompresses messages, answers pings and completes the closing handshake.
/// Sending goes through [`Sender`] handles obtained from [`WebSocket::sender`], which can be
/// cloned and moved to other tasks.
///
/// TLS is not handled here. A TLS stream is just another `S`; pass it to
/// [`WebSocket::client`] or [`WebSocket::accept`] once its own handshake is done.
///
/// When the connection closes, for whatever reason, its pool buffers are returned and its
/// timer task is stopped, exactly once.
pub struct WebSocket<S> {
    reader: ReadHalf<S>,
    shared: Arc<Shared<S>>,
    decoder: Decoder,
    recv: SessionBuffer,
    scratch: Scratch,
    reassembler: Reassembler,
    inbound: Inbound,
    extensions: NegotiatedExtensions,
    protocol: Option<String>,
    cancellation: CancellationToken,
    timers: Option<JoinHandle<()>>,
    torn_down: bool,
}

/// Reads from `io` until `parse` recognises a complete HTTP head.
async fn read_head<S, T>(
    io: &mut S,
    recv: &mut SessionBuffer,
    scratch: &mut Scratch,
    parse: fn(&[u8]) -> std::result::Result<Option<(T, usize)>, HandshakeError>,
) -> Result<(T, usize)>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(head) = parse(recv.as_slice())? {
            return Ok(head);
        }
        let n = io.read(scratch.as_mut_slice()).await?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        recv.append(&scratch.as_slice()[..n])?;
    }
}

/// Answers a failed upgrade with an HTTP error and closes the stream.
async fn reject<S>(io: &mut S, err: &HandshakeError)
where
    S: AsyncWrite + Unpin,
{
    #[cfg(feature = "logging")]
    log::debug!("rejecting upgrade request: {err}");

    let _ = io.write_all(handshake::build_rejection(err).as_bytes()).await;
    let _ = io.shutdown().await;
}

fn handshake_timed_out() -> WebSocketError {
    io::Error::new(io::ErrorKind::TimedOut, "opening handshake timed out").into()
}

impl WebSocket<TcpStream> {
    /// Connects to a `ws://` URL over TCP.
    ///
    /// For `wss://`, establish the TLS stream yourself and hand it to [`WebSocket::client`].
    pub async fn connect(url: Url, options: Options) -> Result<Self> {
        if url.scheme() != "ws" {
            return Err(WebSocketError::InvalidHttpScheme);
        }
        let host = url
            .host_str()
            .ok_or(WebSocketError::InvalidArgument("url has no host"))?;
        let port = url
            .port_or_known_default()
            .ok_or(WebSocketError::InvalidArgument("url has no port"))?;

        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(options.no_delay)?;

        let request = ClientRequest::new(&url)?;
        Self::client(stream, request, options).await
    }
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Performs the client side of the opening handshake over an established stream.
    ///
    /// Subprotocols, origin, cookies and the compression offer from `options` are added to
    /// `request`. The whole exchange is bounded by [`Options::handshake_timeout`].
    ///
    /// # Errors
    /// - [`WebSocketError::Handshake`] if the server's answer is not a valid upgrade.
    /// - [`WebSocketError::Extension`] if the server agreed to extensions that were not
    ///   offered or with invalid parameters.
    pub async fn client(io: S, request: ClientRequest, options: Options) -> Result<Self> {
        tokio::time::timeout(
            options.handshake_timeout,
            Self::client_handshake(io, request, options),
        )
        .await
        .map_err(|_| handshake_timed_out())?
    }

    async fn client_handshake(
        mut io: S,
        mut request: ClientRequest,
        options: Options,
    ) -> Result<Self> {
        if !options.protocols.is_empty() {
            request = request.with_protocols(options.protocols.iter().cloned());
        }
        if let Some(origin) = &options.origin {
            request = request.with_origin(origin.clone());
        }
        for (name, value) in &options.cookies {
            request = request.with_cookie(name.clone(), value.clone());
        }
        if let Some(compression) = &options.compression {
            request = request.with_extensions(extensions::client_offer(compression).to_string());
        }

        let state = StateCell::default();
        state.transition(ConnectionState::None, ConnectionState::Connecting);

        let pool = options.buffer_pool.clone().unwrap_or_default();
        let mut recv = SessionBuffer::new(Arc::clone(&pool))?;
        let mut scratch = Scratch::new(pool)?;

        io.write_all(request.encode().as_bytes()).await?;
        io.flush().await?;

        let (response, head_len) =
            read_head(&mut io, &mut recv, &mut scratch, handshake::parse_response).await?;
        // anything after the head is already frame data
        recv.shift(head_len)?;

        let protocol = handshake::verify_response(&response, &request)?;
        let extensions = extensions::negotiate_client(
            response.headers.get_all("Sec-WebSocket-Extensions").as_deref(),
            options.compression.as_ref(),
        )?;

        let parts = Parts {
            state,
            recv,
            scratch,
            extensions,
            protocol,
        };
        Ok(Self::from_parts(Role::Client, io, parts, &options))
    }

    /// Performs the server side of the opening handshake over an accepted stream.
    ///
    /// A request that is not a valid upgrade is answered with `400 Bad Request` (or
    /// `426 Upgrade Required` for a wrong protocol version) before the error is returned.
    pub async fn accept(io: S, options: Options) -> Result<Self> {
        tokio::time::timeout(
            options.handshake_timeout,
            Self::server_handshake(io, options),
        )
        .await
        .map_err(|_| handshake_timed_out())?
    }

    async fn server_handshake(mut io: S, options: Options) -> Result<Self> {
        let state = StateCell::default();
        state.transition(ConnectionState::None, ConnectionState::Connecting);

        let pool = options.buffer_pool.clone().unwrap_or_default();
        let mut recv = SessionBuffer::new(Arc::clone(&pool))?;
        let mut scratch = Scratch::new(pool)?;

        let (request, head_len) =
            match read_head(&mut io, &mut recv, &mut scratch, handshake::parse_request).await {
                Ok(head) => head,
                Err(WebSocketError::Handshake(err)) => {
                    reject(&mut io, &err).await;
                    return Err(err.into());
                }
                Err(err) => return Err(err),
            };
        recv.shift(head_len)?;

        let upgrade = match handshake::validate_request(&request) {
            Ok(upgrade) => upgrade,
            Err(err) => {
                reject(&mut io, &err).await;
                return Err(err.into());
            }
        };

        let offered = upgrade.extensions.as_deref();
        let extensions = match extensions::negotiate_server(offered, options.compression.as_ref()) {
            Ok(extensions) => extensions,
            Err(err) => {
                let malformed =
                    HandshakeError::Malformed(format!("Sec-WebSocket-Extensions: {}", err.token()));
                reject(&mut io, &malformed).await;
                return Err(err.into());
            }
        };

        let protocol = handshake::select_protocol(&upgrade.protocols, &options.protocols);
        let response = handshake::build_response(
            &upgrade.key,
            protocol.as_deref(),
            extensions.header_value().as_deref(),
        );
        io.write_all(response.as_bytes()).await?;
        io.flush().await?;

        let parts = Parts {
            state,
            recv,
            scratch,
            extensions,
            protocol,
        };
        Ok(Self::from_parts(Role::Server, io, parts, &options))
    }

    fn from_parts(role: Role, io: S, parts: Parts, options: &Options) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let max_message = options.max_message();
        let level = options
            .compression
            .as_ref()
            .map(|compression| compression.level)
            .unwrap_or_default();

        let mut decoder = Decoder::new(role, options.max_payload());
        decoder.set_allowed_rsv(parts.extensions.rsv_mask());

        let shared = Arc::new(Shared::new(
            role,
            parts.state,
            writer,
            parts.extensions.outbound(role, level),
            options.fragment_size,
            options.closing_timeout,
        ));
        shared
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Open);

        let keep_alive = options.keep_alive_interval.map(|interval| KeepAlive {
            interval,
            timeout: options.keep_alive_timeout,
        });
        let timers = keepalive::spawn(Arc::clone(&shared), keep_alive);

        #[cfg(feature = "logging")]
        log::debug!(
            "{role:?} connection open: protocol={:?} extensions={:?}",
            parts.protocol,
            parts.extensions.header_value()
        );

        Self {
            reader,
            shared,
            decoder,
            recv: parts.recv,
            scratch: parts.scratch,
            reassembler: Reassembler::new(max_message),
            inbound: parts.extensions.inbound(role, max_message),
            extensions: parts.extensions,
            protocol: parts.protocol,
            cancellation: options.cancellation.clone().unwrap_or_default(),
            timers: Some(timers),
            torn_down: false,
        }
    }

    /// A handle for sending on this connection.
    pub fn sender(&self) -> Sender<S> {
        Sender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Waits for the next complete message.
    ///
    /// Pings are answered before they are returned, and a close frame from the peer is echoed
    /// and ends the connection. A protocol violation closes the connection with the matching
    /// close code and is returned as the error.
    ///
    /// # Errors
    /// [`WebSocketError::ConnectionClosed`] once the connection is closed, including after a
    /// keep-alive timeout or when the cancellation token fires.
    pub async fn next_message(&mut self) -> Result<Message> {
        loop {
            if self.torn_down || self.shared.state.is_closed() {
                self.teardown();
                return Err(WebSocketError::ConnectionClosed);
            }

            // frames already buffered, e.g. bytes that followed the handshake
            match self.decoder.decode(self.recv.as_slice()) {
                Ok(Some(decoded)) => {
                    if let Err(err) = self.recv.shift(decoded.frame_len) {
                        return Err(self.fail(err).await);
                    }
                    self.shared.touch_received();
                    match self.on_frame(decoded.frame).await {
                        Ok(Some(message)) => return Ok(message),
                        Ok(None) => continue,
                        Err(err) => return Err(self.fail(err).await),
                    }
                }
                Ok(None) => {}
                Err(err) => return Err(self.fail(err).await),
            }

            let event = {
                let buf = self.scratch.as_mut_slice();
                tokio::select! {
                    _ = self.cancellation.cancelled() => Event::Cancelled,
                    _ = self.shared.closed.cancelled() => Event::Closed,
                    res = self.reader.read(buf) => Event::Read(res),
                }
            };

            match event {
                Event::Read(Ok(0)) => {
                    self.shared
                        .force_close(CloseFrame::new(CloseCode::Abnormal, "connection reset"))
                        .await;
                    self.teardown();
                    return Err(WebSocketError::ConnectionClosed);
                }
                Event::Read(Ok(n)) => {
                    if let Err(err) = self.recv.append(&self.scratch.as_slice()[..n]) {
                        return Err(self.fail(err).await);
                    }
                }
                Event::Read(Err(err)) => return Err(self.fail(err.into()).await),
                Event::Cancelled => {
                    self.abort().await;
                    return Err(WebSocketError::ConnectionClosed);
                }
                Event::Closed => {
                    self.teardown();
                    return Err(WebSocketError::ConnectionClosed);
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        let Some(frame) = self.reassembler.push(frame)? else {
            return Ok(None);
        };

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                let rsv = if frame.is_compressed { RSV1 } else { 0 };
                let payload = self.inbound.apply(rsv, frame.payload)?;
                if frame.opcode == OpCode::Text {
                    let text = String::from_utf8(payload.to_vec())
                        .map_err(|_| WebSocketError::InvalidUTF8)?;
                    Ok(Some(Message::Text(text)))
                } else {
                    Ok(Some(Message::Binary(payload.freeze())))
                }
            }
            OpCode::Ping => {
                if self.shared.state.load() == ConnectionState::Open {
                    self.shared
                        .write_frames(&[Frame::pong(&frame.payload)])
                        .await?;
                }
                Ok(Some(Message::Ping(frame.payload.freeze())))
            }
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload.freeze()))),
            OpCode::Close => {
                let close = CloseFrame::parse(&frame.payload)?;
                self.on_close(close.clone()).await;
                Ok(Some(Message::Close(close)))
            }
            // the reassembler folds continuations into their message
            OpCode::Continuation => Err(WebSocketError::InvalidContinuationFrame),
        }
    }

    async fn on_close(&mut self, close: Option<CloseFrame>) {
        if self.shared.begin_close() {
            // the peer started the closing handshake, answer it
            #[cfg(feature = "logging")]
            log::debug!("peer closed the connection: {close:?}");

            self.shared.set_close_reason(close.clone());
            let echo = match &close {
                Some(frame) => Frame::close_frame(frame),
                None => Frame::close_raw(b""),
            };
            let _ = tokio::time::timeout(
                self.shared.closing_timeout,
                self.shared.write_frames(&[echo]),
            )
            .await;
        }

        self.shared
            .force_close(close.unwrap_or_else(|| CloseFrame::new(CloseCode::Status, "")))
            .await;
        self.teardown();
    }

    /// Closes the connection after an error, telling the peer why when the error is its fault.
    async fn fail(&mut self, err: WebSocketError) -> WebSocketError {
        let code = err.close_code();

        #[cfg(feature = "logging")]
        log::debug!("closing connection with {code}: {err}");

        if code != CloseCode::Abnormal && self.shared.begin_close() {
            let frame = Frame::close(code, err.to_string());
            let _ = tokio::time::timeout(
                self.shared.closing_timeout,
                self.shared.write_frames(&[frame]),
            )
            .await;
        }

        self.shared
            .force_close(CloseFrame::new(code, err.to_string()))
            .await;
        self.teardown();
        err
    }

    /// Stops the connection on cancellation, sending a best-effort 1001.
    async fn abort(&mut self) {
        #[cfg(feature = "logging")]
        log::debug!("connection cancelled");

        if self.shared.begin_close() {
            let frame = Frame::close(CloseCode::Away, "");
            let _ = tokio::time::timeout(
                self.shared.closing_timeout,
                self.shared.write_frames(&[frame]),
            )
            .await;
        }
        self.shared
            .force_close(CloseFrame::new(CloseCode::Away, "cancelled"))
            .await;
        self.teardown();
    }

    /// Performs the closing handshake and waits for it to finish.
    ///
    /// The wait is bounded: if the peer does not answer within [`Options::closing_timeout`],
    /// the transport is closed anyway. Messages arriving in the meantime are discarded.
    pub async fn close(&mut self, code: CloseCode, reason: impl Into<String>) -> Result<()> {
        self.sender().close(code, reason).await?;
        loop {
            match self.next_message().await {
                Ok(Message::Close(_)) | Err(_) => return Ok(()),
                Ok(_) => {}
            }
        }
    }

    /// Turns the connection into a stream of messages that ends when the connection closes.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message>> {
        futures::stream::unfold(self, |mut ws| async move {
            match ws.next_message().await {
                Err(WebSocketError::ConnectionClosed) => None,
                item => Some((item, ws)),
            }
        })
    }

    /// Feeds every message to `handler` until the connection closes.
    ///
    /// Returns `Ok(())` after a clean or abnormal close, and the error for a protocol
    /// violation by the peer.
    pub async fn run<H>(mut self, mut handler: H) -> Result<()>
    where
        H: MessageHandler<S>,
    {
        let sender = self.sender();
        loop {
            let message = match self.next_message().await {
                Ok(message) => message,
                Err(WebSocketError::ConnectionClosed) => return Ok(()),
                Err(err) => return Err(err),
            };

            let outcome = AssertUnwindSafe(handler.on_message(&sender, message))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    #[cfg(feature = "logging")]
                    log::warn!("message handler failed: {err}");

                    handler.on_error(&err);
                }
                Err(_) => {
                    #[cfg(feature = "logging")]
                    log::error!("message handler panicked");
                }
            }
        }
    }
}

impl<S> WebSocket<S> {
    /// The connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    /// The subprotocol agreed during the handshake.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// The extensions agreed during the handshake.
    pub fn extensions(&self) -> &NegotiatedExtensions {
        &self.extensions
    }

    /// How the connection was closed: the close frame that ended it, or a locally made up one
    /// with [`CloseCode::Abnormal`] when the transport went away or a timer fired.
    pub fn close_reason(&self) -> Option<CloseFrame> {
        self.shared.close_reason()
    }

    /// Releases everything the connection holds. Runs once; later calls do nothing.
    fn teardown(&mut self) {
        if std::mem::replace(&mut self.torn_down, true) {
            return;
        }

        self.recv.release();
        self.scratch.release();
        self.reassembler.reset();
        if let Some(timers) = self.timers.take() {
            timers.abort();
        }
        self.shared.state.close();
        self.shared.closed.cancel();

        #[cfg(feature = "logging")]
        log::debug!("connection resources released");
    }
}

impl<S> Drop for WebSocket<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}
