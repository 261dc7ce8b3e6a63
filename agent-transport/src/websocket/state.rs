//! Connection lifecycle state machine.

use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

/// States a WebSocket transport's connection can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; the next call opens one.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Open and accepting requests.
    Connected,
    /// Local close in progress; outstanding requests are being failed.
    Closing,
}

impl ConnectionState {
    /// Returns `true` when requests can be sent.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Events that drive lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionEvent {
    HandshakeSucceeded,
    HandshakeFailed,
    Close,
    Closed,
    /// The socket dropped without a local close.
    Lost,
}

#[derive(Debug, Error)]
#[error("invalid connection transition from {from:?} via {event:?}")]
pub(crate) struct InvalidTransition {
    from: ConnectionState,
    event: ConnectionEvent,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    epoch: u64,
}

/// Shared lifecycle for one transport.
///
/// Every connection attempt starts a new epoch; events tagged with an older
/// epoch come from a connection that has since been replaced and are ignored.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    inner: Mutex<Inner>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                epoch: 0,
            }),
        }
    }
}

impl Lifecycle {
    pub(crate) fn state(&self) -> ConnectionState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Starts a connection attempt and returns its epoch. Any connection still
    /// tracked is considered lost.
    pub(crate) fn begin_connect(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.state != ConnectionState::Disconnected {
            debug!(state = ?inner.state, "abandoning previous connection state");
        }
        inner.epoch += 1;
        inner.state = ConnectionState::Connecting;
        debug!(epoch = inner.epoch, "connection lifecycle transition to Connecting");
        inner.epoch
    }

    /// Applies `event` for the connection started at `epoch`.
    pub(crate) fn transition(
        &self,
        epoch: u64,
        event: ConnectionEvent,
    ) -> Result<ConnectionState, InvalidTransition> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.epoch != epoch {
            return Ok(inner.state);
        }

        let next = match (inner.state, event) {
            (ConnectionState::Connecting, ConnectionEvent::HandshakeSucceeded) => {
                Some(ConnectionState::Connected)
            }
            (ConnectionState::Connected, ConnectionEvent::Close) => Some(ConnectionState::Closing),
            (ConnectionState::Connecting, ConnectionEvent::HandshakeFailed)
            | (ConnectionState::Closing, ConnectionEvent::Closed)
            | (_, ConnectionEvent::Lost) => Some(ConnectionState::Disconnected),
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(InvalidTransition {
                from: inner.state,
                event,
            });
        };

        if next_state != inner.state {
            debug!(
                epoch,
                from = ?inner.state,
                to = ?next_state,
                ?event,
                "connection lifecycle transition"
            );
            inner.state = next_state;
        }
        Ok(inner.state)
    }
}
