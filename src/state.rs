//! Connection lifecycle.
//!
//! ```text
//! None --connect--> Connecting --handshake ok--> Open --close (local or remote)--> Closing --> Closed
//! ```
//!
//! Transitions only move forward and `Closed` is terminal. The state lives in an atomic so that
//! the receive loop, the send path and the timers can all read it without taking a lock.
use std::sync::atomic::{AtomicU8, Ordering};

use crate::{Result, WebSocketError};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not connected yet.
    None = 0,
    /// Opening handshake in progress.
    Connecting = 1,
    /// Data may flow in both directions.
    Open = 2,
    /// A close frame was sent or received.
    Closing = 3,
    /// The transport is shut down.
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Connecting,
            2 => Self::Open,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lock-free holder of a [`ConnectionState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ConnectionState::None)
    }
}

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`.
    ///
    /// Returns `false` without changing anything if the current state is not `from` or if `to`
    /// would go backwards.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        if to <= from {
            return false;
        }
        let moved = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        #[cfg(feature = "logging")]
        if moved {
            log::debug!("connection state {from} -> {to}");
        }

        moved
    }

    /// Moves to `Closing` unless the connection is already closing or closed.
    ///
    /// Returns `true` for the caller that performed the move, so the close handshake is started
    /// exactly once.
    pub fn begin_close(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.0.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    #[cfg(feature = "logging")]
                    log::debug!(
                        "connection state {} -> closing",
                        ConnectionState::from_u8(current)
                    );
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Moves to `Closed` from any state.
    ///
    /// Returns `true` only for the caller that performed the move, which is then responsible for
    /// tearing the connection down.
    pub fn close(&self) -> bool {
        let previous = self.0.swap(ConnectionState::Closed as u8, Ordering::AcqRel);

        #[cfg(feature = "logging")]
        if previous != ConnectionState::Closed as u8 {
            log::debug!(
                "connection state {} -> closed",
                ConnectionState::from_u8(previous)
            );
        }

        previous != ConnectionState::Closed as u8
    }

    /// Fails with [`WebSocketError::ConnectionClosed`] unless the connection is open.
    pub fn ensure_open(&self) -> Result<()> {
        match self.load() {
            ConnectionState::Open => Ok(()),
            _ => Err(WebSocketError::ConnectionClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.load() == ConnectionState::Closed
    }
}
