//! Connection timers.
//!
//! One task per connection owns all three timers:
//!
//! - keep-alive: once the connection has been idle (no send and no receive) for the interval,
//!   a ping goes out;
//! - keep-alive timeout: if nothing is received within the timeout after that ping, the
//!   transport is closed and the connection reports 1006;
//! - closing timeout: if the peer has not completed the closing handshake in time after the
//!   connection entered `Closing`, the transport is closed.
//!
//! The task re-reads the connection state every time it wakes up and ends as soon as the
//! connection is closed. Teardown also aborts it, so it never outlives the connection.
use std::{sync::Arc, time::Duration};

use tokio::{
    io::AsyncWrite,
    task::JoinHandle,
    time::{sleep_until, Instant},
};

use crate::{
    close::{CloseCode, CloseFrame},
    frame::Frame,
    state::ConnectionState,
};

use super::sender::Shared;

/// Keep-alive settings.
#[derive(Debug, Clone, Copy)]
pub(super) struct KeepAlive {
    pub(super) interval: Duration,
    pub(super) timeout: Duration,
}

/// What the timer task is waiting for.
enum Deadline {
    /// Idle long enough to send a ping.
    Ping(Instant),
    /// A ping is outstanding since the instant given.
    Pong { sent: Instant, expires: Instant },
    /// The closing handshake must be done by then.
    Closing(Instant),
    /// Nothing to time.
    None,
}

pub(super) fn spawn<S>(shared: Arc<Shared<S>>, keep_alive: Option<KeepAlive>) -> JoinHandle<()>
where
    S: AsyncWrite + Send + 'static,
{
    tokio::spawn(supervise(shared, keep_alive))
}

async fn supervise<S>(shared: Arc<Shared<S>>, keep_alive: Option<KeepAlive>)
where
    S: AsyncWrite + Send,
{
    let mut ping_sent: Option<Instant> = None;

    loop {
        let deadline = match shared.state.load() {
            ConnectionState::Closed => return,
            ConnectionState::Closing => match shared.closing_since() {
                Some(since) => Deadline::Closing(since + shared.closing_timeout),
                None => Deadline::None,
            },
            _ => match (keep_alive, ping_sent) {
                (None, _) => Deadline::None,
                (Some(keep_alive), Some(sent)) => Deadline::Pong {
                    sent,
                    expires: sent + keep_alive.timeout,
                },
                (Some(keep_alive), None) => {
                    Deadline::Ping(shared.last_activity() + keep_alive.interval)
                }
            },
        };

        let at = match deadline {
            Deadline::Ping(at) | Deadline::Pong { expires: at, .. } | Deadline::Closing(at) => {
                Some(at)
            }
            Deadline::None => None,
        };

        tokio::select! {
            _ = shared.closed.cancelled() => return,
            _ = shared.wake.notified() => continue,
            _ = async {
                match at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {}
        }

        match deadline {
            Deadline::Ping(_) => {
                // activity may have moved the deadline while sleeping
                let Some(keep_alive) = keep_alive else { continue };
                if shared.last_activity().elapsed() < keep_alive.interval
                    || shared.state.load() != ConnectionState::Open
                {
                    continue;
                }

                #[cfg(feature = "logging")]
                log::debug!("connection idle for {:?}, sending ping", keep_alive.interval);

                let now = Instant::now();
                if shared.write_frames(&[Frame::ping(b"")]).await.is_ok() {
                    ping_sent = Some(now);
                }
            }
            Deadline::Pong { sent, .. } => {
                if shared.last_received() >= sent {
                    ping_sent = None;
                    continue;
                }

                #[cfg(feature = "logging")]
                log::warn!("no traffic after keep-alive ping, closing connection");

                shared
                    .force_close(CloseFrame::new(CloseCode::Abnormal, "keep-alive timeout"))
                    .await;
                return;
            }
            Deadline::Closing(_) => {
                if shared.state.load() != ConnectionState::Closing {
                    continue;
                }

                #[cfg(feature = "logging")]
                log::warn!("closing handshake timed out, closing transport");

                shared
                    .force_close(CloseFrame::new(CloseCode::Abnormal, "closing timeout"))
                    .await;
                return;
            }
            Deadline::None => {}
        }
    }
}
