//! Connection state machine.
//!
//! ```text
//!                connect()            Opened
//! Disconnected ───────────► Connecting ───────► Connected
//!      ▲                      │    │               │
//!      │   ConnectionError /  │    │ close()       │ close()
//!      │   Closed             │    ▼               ▼
//!      └──────────────────────┴── Closing ◄────────┘
//!                 Closed
//! ```
//!
//! The manager is the only owner of [`ConnectionState`]. It filters raw
//! transport events: events from superseded attempts are dropped, and
//! inbound messages only pass through while `Connected`.

use std::fmt;

use crate::ipc::client::IpcError;
use crate::ipc::transport::{Transport, TransportEvent, TransportEventKind};

/// Lifecycle state of the single pipeline connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns the transport and the state machine around it.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    state: ConnectionState,
    /// Number of the current (most recent) connection attempt.
    attempt: u64,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            attempt: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start a new connection attempt.
    ///
    /// Only valid while `Disconnected`. Returns the attempt number.
    pub fn connect(&mut self) -> Result<u64, IpcError> {
        if self.state != ConnectionState::Disconnected {
            return Err(IpcError::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }

        self.attempt += 1;
        self.state = ConnectionState::Connecting;
        self.transport.open(self.attempt);
        Ok(self.attempt)
    }

    /// Transmit one text frame. Only valid while `Connected`.
    pub fn send(&mut self, text: String) -> Result<(), IpcError> {
        if self.state != ConnectionState::Connected {
            return Err(IpcError::NotConnected(self.state));
        }
        self.transport.send(text)
    }

    /// Begin an orderly shutdown of the current attempt.
    ///
    /// The state becomes `Disconnected` once the transport reports closure.
    pub fn close(&mut self) -> Result<(), IpcError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.state = ConnectionState::Closing;
                self.transport.close();
                Ok(())
            }
            state => Err(IpcError::InvalidState {
                operation: "close",
                state,
            }),
        }
    }

    /// Apply a transport event to the state machine.
    ///
    /// Returns the event when it is relevant to the current attempt and
    /// state, `None` when it was dropped.
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<TransportEventKind> {
        if event.attempt != self.attempt {
            tracing::debug!(
                attempt = event.attempt,
                current = self.attempt,
                "Ignoring event from superseded connection attempt"
            );
            return None;
        }

        let state = self.state;
        match event.kind {
            TransportEventKind::Opened => {
                if state == ConnectionState::Connecting {
                    self.state = ConnectionState::Connected;
                    Some(TransportEventKind::Opened)
                } else {
                    // Close raced the handshake; the Closed event finishes the job
                    tracing::debug!(%state, "Ignoring open event");
                    None
                }
            }
            kind @ (TransportEventKind::ConnectionError(_) | TransportEventKind::Closed { .. }) => {
                if state == ConnectionState::Disconnected {
                    tracing::debug!("Ignoring termination event while already disconnected");
                    None
                } else {
                    self.state = ConnectionState::Disconnected;
                    Some(kind)
                }
            }
            kind @ TransportEventKind::Message(_) => {
                if state == ConnectionState::Connected {
                    Some(kind)
                } else {
                    tracing::debug!(%state, "Dropping inbound message received outside connected state");
                    None
                }
            }
            kind @ TransportEventKind::Sent(_) => {
                matches!(state, ConnectionState::Connected | ConnectionState::Closing).then_some(kind)
            }
        }
    }
}
