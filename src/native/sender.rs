//! The send path of a connection.
//!
//! Every frame goes through one lock around the write half, so frames of a fragmented message
//! are never interleaved with other frames and compression with context takeover sees messages
//! in wire order. The receive loop never takes this lock except to answer pings and closes.
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, WriteHalf},
    sync::Notify,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    close::{CloseCode, CloseFrame},
    codec::{Encoder, Role},
    extensions::{Outbound, RSV1},
    fragment::fragment,
    frame::{Frame, OpCode},
    state::{ConnectionState, StateCell},
    Result, WebSocketError,
};

use super::Message;

struct Writer<S> {
    io: WriteHalf<S>,
    encoder: Encoder,
    outbound: Outbound,
    buf: BytesMut,
    fragment_size: Option<usize>,
}

/// State shared by the receive loop, every [`Sender`] and the timer task.
pub(super) struct Shared<S> {
    pub(super) state: StateCell,
    pub(super) role: Role,
    pub(super) closing_timeout: Duration,
    /// Cancelled once the transport is closed.
    pub(super) closed: CancellationToken,
    /// Wakes the timer task when the state changes.
    pub(super) wake: Notify,
    writer: tokio::sync::Mutex<Writer<S>>,
    last_sent: Mutex<Instant>,
    last_received: Mutex<Instant>,
    closing_since: Mutex<Option<Instant>>,
    close_reason: Mutex<Option<CloseFrame>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S> Shared<S> {
    pub(super) fn touch_received(&self) {
        *lock(&self.last_received) = Instant::now();
    }

    pub(super) fn last_received(&self) -> Instant {
        *lock(&self.last_received)
    }

    /// Most recent send or receive.
    pub(super) fn last_activity(&self) -> Instant {
        (*lock(&self.last_sent)).max(*lock(&self.last_received))
    }

    pub(super) fn closing_since(&self) -> Option<Instant> {
        *lock(&self.closing_since)
    }

    pub(super) fn close_reason(&self) -> Option<CloseFrame> {
        lock(&self.close_reason).clone()
    }

    pub(super) fn set_close_reason(&self, reason: Option<CloseFrame>) {
        let mut current = lock(&self.close_reason);
        if current.is_none() {
            *current = reason;
        }
    }

    /// Moves to `Closing` and starts the closing timer. Returns `false` if the connection was
    /// already closing or closed.
    pub(super) fn begin_close(&self) -> bool {
        if !self.state.begin_close() {
            return false;
        }
        *lock(&self.closing_since) = Some(Instant::now());
        self.wake.notify_one();
        true
    }
}

impl<S> Shared<S>
where
    S: AsyncWrite + Send,
{
    /// Takes over `state`, which the opening handshake has moved to `Connecting`.
    pub(super) fn new(
        role: Role,
        state: StateCell,
        io: WriteHalf<S>,
        outbound: Outbound,
        fragment_size: Option<usize>,
        closing_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            state,
            role,
            closing_timeout,
            closed: CancellationToken::new(),
            wake: Notify::new(),
            writer: tokio::sync::Mutex::new(Writer {
                io,
                encoder: Encoder::new(role),
                outbound,
                buf: BytesMut::new(),
                fragment_size,
            }),
            last_sent: Mutex::new(now),
            last_received: Mutex::new(now),
            closing_since: Mutex::new(None),
            close_reason: Mutex::new(None),
        }
    }

    /// Writes `frames` back to back and flushes.
    pub(super) async fn write_frames(&self, frames: &[Frame]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = &mut *writer;

        writer.buf.clear();
        for frame in frames {
            writer.encoder.encode_frame(frame, &mut writer.buf)?;
        }
        self.flush(writer).await
    }

    /// Compresses, fragments and writes one data message.
    pub(super) async fn write_message(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = &mut *writer;

        let (payload, rsv) = writer.outbound.apply(payload)?;
        let is_compressed = rsv & RSV1 != 0;
        let frames = match writer.fragment_size {
            Some(size) => fragment(opcode, &payload, size, is_compressed)?,
            None => vec![Frame {
                fin: true,
                opcode,
                is_compressed,
                payload,
            }],
        };

        writer.buf.clear();
        for frame in &frames {
            writer.encoder.encode_frame(frame, &mut writer.buf)?;
        }
        self.flush(writer).await
    }

    async fn flush(&self, writer: &mut Writer<S>) -> Result<()> {
        let io = &mut writer.io;
        let buf = &writer.buf;
        tokio::select! {
            res = async {
                io.write_all(buf).await?;
                io.flush().await
            } => res?,
            _ = self.closed.cancelled() => return Err(WebSocketError::ConnectionClosed),
        }
        writer.buf.clear();
        *lock(&self.last_sent) = Instant::now();
        Ok(())
    }

    /// Closes the transport without a closing handshake.
    ///
    /// Only the first caller does anything; `reason` is what [`super::WebSocket::close_reason`]
    /// reports afterwards.
    pub(super) async fn force_close(&self, reason: CloseFrame) {
        if !self.state.close() {
            return;
        }

        #[cfg(feature = "logging")]
        log::debug!("closing transport ({} {})", reason.code, reason.reason);

        self.set_close_reason(Some(reason));
        // unblocks any sender stuck on a full transport before taking the lock
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        let _ = writer.io.shutdown().await;
    }
}

/// A cloneable handle for sending on a connection.
///
/// Senders can be moved to other tasks; they stay usable until the connection closes, after
/// which every call fails with [`WebSocketError::ConnectionClosed`].
pub struct Sender<S> {
    pub(super) shared: Arc<Shared<S>>,
}

impl<S> Clone for Sender<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> Sender<S>
where
    S: AsyncWrite + Send,
{
    /// Sends a message.
    ///
    /// Sending [`Message::Close`] starts the closing handshake like [`Sender::close`].
    pub async fn send(&self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_text(text).await,
            Message::Binary(data) => self.send_binary(data).await,
            Message::Ping(data) => self.ping(data).await,
            Message::Pong(data) => self.pong(data).await,
            Message::Close(Some(frame)) => self.close(frame.code, frame.reason).await,
            Message::Close(None) => self.close_frame(None).await,
        }
    }

    pub async fn send_text(&self, text: impl AsRef<str>) -> Result<()> {
        self.shared.state.ensure_open()?;
        self.shared
            .write_message(OpCode::Text, text.as_ref().as_bytes())
            .await
    }

    pub async fn send_binary(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.shared.state.ensure_open()?;
        self.shared
            .write_message(OpCode::Binary, data.as_ref())
            .await
    }

    /// Sends a data message as fragments of at most `size` bytes, regardless of
    /// [`Options::fragment_size`](crate::Options::fragment_size).
    ///
    /// `opcode` must be [`OpCode::Text`] or [`OpCode::Binary`].
    pub async fn send_fragmented(
        &self,
        opcode: OpCode,
        payload: impl AsRef<[u8]>,
        size: usize,
    ) -> Result<()> {
        self.shared.state.ensure_open()?;
        let frames = fragment(opcode, payload.as_ref(), size, false)?;
        self.shared.write_frames(&frames).await
    }

    /// Sends a ping. The payload must not exceed 125 bytes.
    pub async fn ping(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.shared.state.ensure_open()?;
        self.shared.write_frames(&[Frame::ping(payload)]).await
    }

    /// Sends an unsolicited pong. The payload must not exceed 125 bytes.
    pub async fn pong(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.shared.state.ensure_open()?;
        self.shared.write_frames(&[Frame::pong(payload)]).await
    }

    /// Starts the closing handshake.
    ///
    /// This does not wait for the peer's answer: the receive loop reports it, and the
    /// connection is closed anyway once the closing timeout expires. Calling this on a
    /// connection that is already closing does nothing.
    ///
    /// Fails with [`WebSocketError::InvalidArgument`] for codes that must not be sent, such as
    /// 1005, 1006, 1015 or a reserved code.
    pub async fn close(&self, code: CloseCode, reason: impl Into<String>) -> Result<()> {
        if !code.is_allowed() {
            return Err(WebSocketError::InvalidArgument(
                "close code may not be sent on the wire",
            ));
        }
        self.close_frame(Some(CloseFrame::new(code, reason))).await
    }

    async fn close_frame(&self, frame: Option<CloseFrame>) -> Result<()> {
        if !self.shared.begin_close() {
            return match self.shared.state.load() {
                ConnectionState::Closed => Err(WebSocketError::ConnectionClosed),
                _ => Ok(()),
            };
        }

        #[cfg(feature = "logging")]
        log::debug!("sending close frame {frame:?}");

        let close = match &frame {
            Some(frame) => Frame::close_frame(frame),
            None => Frame::close_raw(b""),
        };
        self.shared.set_close_reason(frame);
        if let Err(err) = self.shared.write_frames(&[close]).await {
            self.shared
                .force_close(CloseFrame::new(CloseCode::Abnormal, err.to_string()))
                .await;
            return Err(err);
        }
        Ok(())
    }

    /// Closes the transport immediately, without a closing handshake.
    pub async fn shutdown(&self) {
        self.shared
            .force_close(CloseFrame::new(CloseCode::Abnormal, "shutdown"))
            .await;
    }

    /// Which end of the connection this sender writes for.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// The connection state as seen by this sender.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.is_closed()
    }
}
