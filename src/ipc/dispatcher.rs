//! Call dispatch and reply routing.
//!
//! The dispatcher ties the codec, the call registry and the connection
//! manager together. Outbound calls are fire-and-forget; replies are
//! correlated by id, logged, and returned as [`Reply`] values for the
//! coordinating task to publish.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ipc::client::IpcError;
use crate::ipc::codec::{self, DecodedMessage};
use crate::ipc::connection::{ConnectionManager, ConnectionState};
use crate::ipc::registry::CallRegistry;
use crate::ipc::transport::{Transport, TransportEvent, TransportEventKind};
use crate::protocol::{CallId, RpcCall, RpcError};

/// Reply to a tracked call, tagged with the method that was called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Result {
        id: CallId,
        method: String,
        result: String,
    },
    Error {
        id: CallId,
        method: String,
        error: RpcError,
    },
}

impl Reply {
    pub fn id(&self) -> CallId {
        match self {
            Reply::Result { id, .. } | Reply::Error { id, .. } => *id,
        }
    }

    pub fn method(&self) -> &str {
        match self {
            Reply::Result { method, .. } | Reply::Error { method, .. } => method,
        }
    }

    /// Convert into the result string, or `IpcError::ServerError`.
    pub fn into_result(self) -> Result<String, IpcError> {
        match self {
            Reply::Result { result, .. } => Ok(result),
            Reply::Error { error, .. } => Err(error.into()),
        }
    }
}

/// Owns the connection manager and the call registry.
///
/// All methods take `&mut self`: the dispatcher is driven by exactly one
/// task, which makes it the single writer of both.
pub struct Dispatcher<T: Transport> {
    connection: ConnectionManager<T>,
    registry: CallRegistry,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            connection: ConnectionManager::new(transport),
            registry: CallRegistry::new(),
        }
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Start a connection attempt.
    pub fn connect(&mut self) -> Result<u64, IpcError> {
        let attempt = self.connection.connect()?;
        tracing::info!(attempt, "Connecting to pipeline server");
        Ok(attempt)
    }

    /// Start an orderly close of the current connection.
    pub fn close(&mut self) -> Result<(), IpcError> {
        self.connection.close()?;
        tracing::info!(
            pending = self.registry.len(),
            "Closing connection to pipeline server"
        );
        Ok(())
    }

    /// Send a fire-and-forget call.
    ///
    /// When not connected the call is dropped: no id is consumed and the
    /// registry is untouched. The error is logged here; callers may ignore
    /// the returned value.
    pub fn call_method(&mut self, method: &str, args: Vec<String>) -> Result<CallId, IpcError> {
        if !self.connection.is_connected() {
            let state = self.connection.state();
            tracing::error!(method, %state, "Dropping call: not connected to pipeline server");
            return Err(IpcError::NotConnected(state));
        }

        let id = self.registry.next_id();
        let call = RpcCall::new(method, args, id);
        let text = codec::encode(&call)?;

        if let Err(e) = self.connection.send(text) {
            tracing::error!(id, method, error = %e, "Failed to send call");
            return Err(e);
        }

        self.registry.track(id, method);
        tracing::debug!(id, method, "Call sent");
        Ok(id)
    }

    /// Route one transport event through the state machine and hooks.
    ///
    /// Returns the reply when the event was a response to a tracked call.
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<Reply> {
        match self.connection.handle_event(event)? {
            TransportEventKind::Opened => {
                self.on_connected();
                None
            }
            TransportEventKind::ConnectionError(reason) => {
                self.on_connection_error(&reason);
                None
            }
            TransportEventKind::Closed {
                code,
                reason,
                clean,
            } => {
                self.on_closed(code, &reason, clean);
                None
            }
            TransportEventKind::Message(raw) => self.on_message(&raw),
            TransportEventKind::Sent(raw) => {
                self.on_message_sent(&raw);
                None
            }
        }
    }

    /// Decode an inbound frame and resolve the call it answers.
    pub fn on_message(&mut self, raw: &[u8]) -> Option<Reply> {
        match codec::decode(raw) {
            DecodedMessage::ResultMessage(response) => {
                let Some(call) = self.registry.resolve(response.id) else {
                    tracing::debug!(id = response.id, "Ignoring result for unknown call id");
                    return None;
                };
                tracing::info!(
                    id = response.id,
                    method = %call.method,
                    result = %response.result,
                    "Call succeeded"
                );
                Some(Reply::Result {
                    id: response.id,
                    method: call.method,
                    result: response.result,
                })
            }
            DecodedMessage::ErrorMessage(response) => {
                let Some(call) = self.registry.resolve(response.id) else {
                    tracing::debug!(
                        id = response.id,
                        code = response.error.code,
                        error_message = %response.error.message,
                        "Ignoring error for unknown call id"
                    );
                    return None;
                };
                tracing::warn!(
                    id = response.id,
                    method = %call.method,
                    code = response.error.code,
                    error_message = %response.error.message,
                    data = %response.error.data,
                    "Call failed"
                );
                Some(Reply::Error {
                    id: response.id,
                    method: call.method,
                    error: response.error,
                })
            }
            DecodedMessage::Malformed { raw, reason } => {
                tracing::warn!(
                    %reason,
                    payload = %String::from_utf8_lossy(&raw),
                    "Discarding malformed message"
                );
                None
            }
        }
    }

    pub fn on_connected(&self) {
        tracing::info!(
            attempt = self.connection.attempt(),
            "Connected to pipeline server"
        );
    }

    pub fn on_connection_error(&mut self, reason: &str) {
        tracing::error!(
            attempt = self.connection.attempt(),
            %reason,
            "Connection to pipeline server failed"
        );
        self.abandon_pending();
    }

    pub fn on_closed(&mut self, code: u16, reason: &str, clean: bool) {
        if clean {
            tracing::info!(code, %reason, "Connection to pipeline server closed");
        } else {
            tracing::error!(code, %reason, "Connection to pipeline server lost");
        }
        self.abandon_pending();
    }

    pub fn on_message_sent(&self, raw: &str) {
        tracing::debug!(payload = %raw, "Message sent");
    }

    /// Drop pending calls older than `max_age`. Returns how many were dropped.
    pub fn prune_expired(&mut self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let expired = self.registry.prune_older_than(max_age, now);
        for (id, call) in &expired {
            tracing::warn!(
                id,
                method = %call.method,
                submitted_at = %call.submitted_at,
                "Abandoning call with no reply"
            );
        }
        expired.len()
    }

    /// Forget every pending call; their replies can no longer arrive.
    fn abandon_pending(&mut self) {
        let abandoned = self.registry.clear();
        if abandoned > 0 {
            tracing::warn!(abandoned, "Abandoned pending calls on disconnect");
        }
    }
}
