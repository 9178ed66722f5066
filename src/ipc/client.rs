//! Connection handle for the Ayon pipeline server.
//!
//! This module provides [`Connection`], the handle the editor side holds for
//! the lifetime of the process. It spawns one coordinating task that owns the
//! [`Dispatcher`] and consumes two queues:
//!
//! - commands from the handle (`connect`, `close`, `call_method`, ...)
//! - socket events from the transport (open, error, close, message, sent)
//!
//! Because that task is the only writer of the call registry and connection
//! state, no locking is needed around either.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite;

use crate::config::ClientConfig;
use crate::ipc::connection::ConnectionState;
use crate::ipc::dispatcher::{Dispatcher, Reply};
use crate::ipc::transport::{Transport, TransportEvent, WebSocketTransport};
use crate::protocol::{CallId, RpcError};

/// Capacity of the reply broadcast channel before slow subscribers lag.
const REPLY_CHANNEL_BOUND: usize = 64;

/// How long shutdown waits for the server to confirm the close handshake.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// IPC-specific error types.
///
/// These errors provide actionable messages for common failure modes
/// when communicating with the pipeline server.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to reach the server (refused, unresolvable host, ...).
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation requires an open connection.
    #[error("Not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// Lifecycle operation not valid in the current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    /// Protocol-level error (encoding, unexpected message shape).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned a JSON-RPC error response.
    #[error("Server error {code}: {message}")]
    ServerError {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
        /// Additional data, empty when the server sent none
        data: String,
    },

    /// WebSocket failure after the connection was established.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The coordinating task is gone.
    #[error("Connection service has shut down")]
    Shutdown,
}

impl From<tungstenite::Error> for IpcError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io) => match io.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                    IpcError::ConnectionFailed(io.to_string())
                }
                _ => IpcError::Transport(io.to_string()),
            },
            tungstenite::Error::Url(e) => IpcError::ConnectionFailed(e.to_string()),
            tungstenite::Error::Http(response) => {
                IpcError::ConnectionFailed(format!("Handshake rejected: HTTP {}", response.status()))
            }
            other => IpcError::Transport(other.to_string()),
        }
    }
}

impl From<RpcError> for IpcError {
    fn from(err: RpcError) -> Self {
        IpcError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Request from the handle to the coordinating task.
#[derive(Debug)]
enum Command {
    Connect,
    Close,
    Call { method: String, args: Vec<String> },
    PendingCalls(oneshot::Sender<Vec<CallId>>),
    Shutdown,
}

/// Handle to the single pipeline connection.
///
/// Created once at startup and passed by reference to whatever needs to call
/// into the pipeline. All methods are non-blocking except [`shutdown`] and
/// [`pending_calls`], which wait on the coordinating task.
///
/// # Connection Lifecycle
///
/// - [`create`] - allocate the connection without opening it
/// - [`connect`] - start the WebSocket handshake
/// - [`call_method`] - fire-and-forget call, dropped if not connected
/// - [`close`] - orderly close; reconnects are cancelled
/// - [`shutdown`] - close and stop the coordinating task
///
/// # Example
///
/// ```ignore
/// use ayon_rpc::{ClientConfig, Connection};
///
/// let connection = Connection::create(ClientConfig::from_env()?);
/// connection.connect()?;
/// // ... once connected:
/// connection.call_method("loader_tool", vec![])?;
/// ```
///
/// [`create`]: Connection::create
/// [`connect`]: Connection::connect
/// [`call_method`]: Connection::call_method
/// [`close`]: Connection::close
/// [`shutdown`]: Connection::shutdown
/// [`pending_calls`]: Connection::pending_calls
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    replies: broadcast::Sender<Reply>,
    /// Handle to the coordinating task for graceful shutdown.
    worker: Option<JoinHandle<()>>,
}

impl Connection {
    /// Allocate the connection over a WebSocket transport, without opening it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(config: ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = WebSocketTransport::new(config.url.clone(), events_tx);
        Self::with_transport(transport, events_rx, config)
    }

    /// Allocate the connection over a custom transport.
    ///
    /// `events` must receive every event the transport produces.
    pub fn with_transport<T>(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: ClientConfig,
    ) -> Self
    where
        T: Transport + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (replies_tx, _) = broadcast::channel(REPLY_CHANNEL_BOUND);

        let coordinator = Coordinator {
            dispatcher: Dispatcher::new(transport),
            config,
            state: state_tx,
            replies: replies_tx.clone(),
            want_connected: false,
            reconnect_attempts: 0,
            reconnect_at: None,
        };
        let worker = tokio::spawn(coordinator.run(commands_rx, events));

        Self {
            commands: commands_tx,
            state: state_rx,
            replies: replies_tx,
            worker: Some(worker),
        }
    }

    /// Start connecting. Progress is observable through [`Connection::watch_state`].
    pub fn connect(&self) -> Result<(), IpcError> {
        self.send_command(Command::Connect)
    }

    /// Close the connection and cancel any scheduled reconnect.
    pub fn close(&self) -> Result<(), IpcError> {
        self.send_command(Command::Close)
    }

    /// Fire-and-forget call.
    ///
    /// The call is dropped (and logged) if the connection is not open when
    /// the coordinating task processes it. Replies are published to
    /// [`Connection::subscribe`] receivers.
    pub fn call_method(&self, method: impl Into<String>, args: Vec<String>) -> Result<(), IpcError> {
        self.send_command(Command::Call {
            method: method.into(),
            args,
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Receive replies to calls made after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<Reply> {
        self.replies.subscribe()
    }

    /// Ids of calls still awaiting a reply, in ascending order.
    pub async fn pending_calls(&self) -> Result<Vec<CallId>, IpcError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::PendingCalls(tx))?;
        rx.await.map_err(|_| IpcError::Shutdown)
    }

    /// Close the socket, stop the coordinating task and wait for it.
    pub async fn shutdown(mut self) -> Result<(), IpcError> {
        // The task may already have exited; joining below still applies
        let _ = self.commands.send(Command::Shutdown);

        if let Some(worker) = self.worker.take() {
            worker
                .await
                .map_err(|e| IpcError::Transport(format!("Coordinator task failed: {}", e)))?;
        }
        Ok(())
    }

    fn send_command(&self, command: Command) -> Result<(), IpcError> {
        self.commands.send(command).map_err(|_| IpcError::Shutdown)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Without an explicit shutdown the task is told to stop and left to
        // finish on its own; Drop cannot await it.
        if self.worker.is_some() {
            let _ = self.commands.send(Command::Shutdown);
            tracing::debug!("Connection dropped without shutdown; coordinator detached");
        }
    }
}

/// State owned by the coordinating task.
struct Coordinator<T: Transport> {
    dispatcher: Dispatcher<T>,
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    replies: broadcast::Sender<Reply>,
    /// Whether the caller wants the connection open (connect without close).
    want_connected: bool,
    /// Reconnects attempted since the last successful open.
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
}

impl<T: Transport> Coordinator<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let prune_every = self.config.prune_interval();
        let mut prune = tokio::time::interval(prune_every.unwrap_or(Duration::from_secs(3600)));
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = wait_until(self.reconnect_at) => self.reconnect(),
                _ = prune.tick(), if prune_every.is_some() => self.prune(),
            }
            self.publish_state();
        }

        self.shutdown(&mut events).await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.want_connected = true;
                self.reconnect_attempts = 0;
                self.reconnect_at = None;
                if let Err(e) = self.dispatcher.connect() {
                    tracing::warn!(error = %e, "Ignoring connect request");
                }
            }
            Command::Close => {
                self.want_connected = false;
                self.reconnect_at = None;
                if let Err(e) = self.dispatcher.close() {
                    tracing::debug!(error = %e, "Ignoring close request");
                }
            }
            Command::Call { method, args } => {
                // Failures are logged by the dispatcher; calls are one-way
                let _ = self.dispatcher.call_method(&method, args);
            }
            Command::PendingCalls(reply) => {
                let _ = reply.send(self.dispatcher.registry().pending_ids());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        let before = self.dispatcher.state();

        if let Some(reply) = self.dispatcher.handle_event(event) {
            // No subscribers is fine: the reply was already logged
            let _ = self.replies.send(reply);
        }

        let after = self.dispatcher.state();
        if after == before {
            return;
        }

        match after {
            ConnectionState::Connected => self.reconnect_attempts = 0,
            ConnectionState::Disconnected if self.want_connected => self.schedule_reconnect(),
            _ => {}
        }
    }

    fn schedule_reconnect(&mut self) {
        let policy = &self.config.reconnect;

        if self.reconnect_attempts >= policy.max_attempts {
            if policy.is_enabled() {
                tracing::error!(
                    attempts = self.reconnect_attempts,
                    "Giving up reconnecting to pipeline server"
                );
            }
            self.want_connected = false;
            return;
        }

        self.reconnect_attempts += 1;
        let delay = policy.delay_for(self.reconnect_attempts);
        tracing::info!(
            attempt = self.reconnect_attempts,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn reconnect(&mut self) {
        self.reconnect_at = None;
        if !self.want_connected || self.dispatcher.state() != ConnectionState::Disconnected {
            return;
        }
        if let Err(e) = self.dispatcher.connect() {
            tracing::warn!(error = %e, "Reconnect attempt not started");
        }
    }

    fn prune(&mut self) {
        if let Some(max_age) = self.config.pending_timeout {
            self.dispatcher.prune_expired(max_age, Utc::now());
        }
    }

    fn publish_state(&self) {
        let current = self.dispatcher.state();
        self.state.send_if_modified(|published| {
            if *published == current {
                return false;
            }
            *published = current;
            true
        });
    }

    /// Close the socket and give the server a moment to confirm.
    async fn shutdown(&mut self, events: &mut mpsc::UnboundedReceiver<TransportEvent>) {
        self.want_connected = false;
        self.reconnect_at = None;

        if self.dispatcher.close().is_ok() {
            self.publish_state();
            let confirmed = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while let Some(event) = events.recv().await {
                    self.handle_event(event);
                    if self.dispatcher.state() == ConnectionState::Disconnected {
                        break;
                    }
                }
            })
            .await;

            if confirmed.is_err() {
                tracing::warn!("Server did not confirm close before shutdown");
            }
        }

        self.publish_state();
        tracing::debug!("Connection coordinator stopped");
    }
}

/// Resolve at `deadline`, or never when there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::ipc::transport::mock::MockTransport;
    use crate::ipc::transport::TransportEventKind;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config() -> ClientConfig {
        ClientConfig::default().with_reconnect(ReconnectPolicy::disabled())
    }

    fn spawn_mock(
        config: ClientConfig,
    ) -> (Connection, MockTransport, mpsc::UnboundedSender<TransportEvent>) {
        let transport = MockTransport::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Connection::with_transport(transport.clone(), events_rx, config);
        (connection, transport, events_tx)
    }

    async fn wait_for_state(connection: &Connection, target: ConnectionState) {
        let mut rx = connection.watch_state();
        timeout(TEST_TIMEOUT, rx.wait_for(|s| *s == target))
            .await
            .expect("Test timed out")
            .expect("State channel closed");
    }

    /// Poll until the mock has seen `count` opens.
    async fn wait_for_opens(transport: &MockTransport, count: usize) {
        timeout(TEST_TIMEOUT, async {
            while transport.opened().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Test timed out");
    }

    async fn open(
        connection: &Connection,
        transport: &MockTransport,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        connection.connect().unwrap();
        wait_for_opens(transport, 1).await;
        events
            .send(TransportEvent::new(1, TransportEventKind::Opened))
            .unwrap();
        wait_for_state(connection, ConnectionState::Connected).await;
    }

    #[test]
    fn test_ipc_error_display() {
        let server_err = IpcError::ServerError {
            code: -32000,
            message: "Database error".to_string(),
            data: String::new(),
        };
        assert_eq!(server_err.to_string(), "Server error -32000: Database error");

        let not_connected = IpcError::NotConnected(ConnectionState::Connecting);
        assert_eq!(not_connected.to_string(), "Not connected (state: connecting)");

        let invalid = IpcError::InvalidState {
            operation: "close",
            state: ConnectionState::Disconnected,
        };
        assert_eq!(invalid.to_string(), "Cannot close while disconnected");
    }

    #[test]
    fn test_ipc_error_from_tungstenite_io() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let ipc_err: IpcError = tungstenite::Error::Io(refused).into();
        assert!(matches!(ipc_err, IpcError::ConnectionFailed(_)));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "other");
        let ipc_err: IpcError = tungstenite::Error::Io(other).into();
        assert!(matches!(ipc_err, IpcError::Transport(_)));

        let ipc_err: IpcError = tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(ipc_err, IpcError::Transport(_)));
    }

    #[test]
    fn test_ipc_error_from_rpc_error() {
        let rpc_err = RpcError {
            code: -32601,
            message: "Method not found".to_string(),
            data: "loader_tool".to_string(),
        };

        match IpcError::from(rpc_err) {
            IpcError::ServerError {
                code,
                message,
                data,
            } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
                assert_eq!(data, "loader_tool");
            }
            other => panic!("Expected ServerError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_and_reply_through_coordinator() {
        let (connection, transport, events) = spawn_mock(test_config());
        let mut replies = connection.subscribe();
        open(&connection, &transport, &events).await;

        connection.call_method("loader_tool", vec![]).unwrap();
        assert_eq!(connection.pending_calls().await.unwrap(), vec![1]);
        assert_eq!(
            transport.sent(),
            vec![r#"{"jsonrpc":"2.0","method":"loader_tool","params":[],"id":1}"#.to_string()]
        );

        events
            .send(TransportEvent::new(
                1,
                TransportEventKind::Message(br#"{"jsonrpc":"2.0","result":"ok","id":1}"#.to_vec()),
            ))
            .unwrap();

        let reply = timeout(TEST_TIMEOUT, replies.recv())
            .await
            .expect("Test timed out")
            .expect("Reply channel closed");
        assert_eq!(
            reply,
            Reply::Result {
                id: 1,
                method: "loader_tool".to_string(),
                result: "ok".to_string(),
            }
        );
        assert!(connection.pending_calls().await.unwrap().is_empty());

        // Closed event channel ends the close grace period immediately
        drop(events);
        connection.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_before_connect_is_dropped() {
        let (connection, transport, _events) = spawn_mock(test_config());

        connection.call_method("loader_tool", vec![]).unwrap();

        assert!(connection.pending_calls().await.unwrap().is_empty());
        assert!(transport.sent().is_empty());
        assert!(!connection.is_connected());

        connection.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_clears_pending_calls() {
        let (connection, transport, events) = spawn_mock(test_config());
        open(&connection, &transport, &events).await;

        for method in ["loader_tool", "creator_tool", "publish_tool"] {
            connection.call_method(method, vec![]).unwrap();
        }
        assert_eq!(connection.pending_calls().await.unwrap(), vec![1, 2, 3]);

        connection.close().unwrap();
        wait_for_state(&connection, ConnectionState::Closing).await;
        assert_eq!(transport.closes(), 1);

        events
            .send(TransportEvent::new(
                1,
                TransportEventKind::Closed {
                    code: 1000,
                    reason: String::new(),
                    clean: true,
                },
            ))
            .unwrap();
        wait_for_state(&connection, ConnectionState::Disconnected).await;

        assert!(connection.pending_calls().await.unwrap().is_empty());
        connection.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_drop_schedules_reconnect() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        let (connection, transport, events) =
            spawn_mock(ClientConfig::default().with_reconnect(policy));
        open(&connection, &transport, &events).await;

        events
            .send(TransportEvent::new(
                1,
                TransportEventKind::Closed {
                    code: 1006,
                    reason: "reset".to_string(),
                    clean: false,
                },
            ))
            .unwrap();

        wait_for_opens(&transport, 2).await;
        assert_eq!(transport.opened(), vec![1, 2]);

        events
            .send(TransportEvent::new(2, TransportEventKind::Opened))
            .unwrap();
        wait_for_state(&connection, ConnectionState::Connected).await;

        drop(events);
        connection.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
        };
        let (connection, transport, events) =
            spawn_mock(ClientConfig::default().with_reconnect(policy));

        connection.connect().unwrap();
        for attempt in 1..=3u64 {
            wait_for_opens(&transport, attempt as usize).await;
            events
                .send(TransportEvent::new(
                    attempt,
                    TransportEventKind::ConnectionError("refused".to_string()),
                ))
                .unwrap();
        }

        // Initial attempt plus two reconnects, then nothing more
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.opened(), vec![1, 2, 3]);
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_close_does_not_reconnect() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
        };
        let (connection, transport, events) =
            spawn_mock(ClientConfig::default().with_reconnect(policy));
        open(&connection, &transport, &events).await;

        connection.close().unwrap();
        wait_for_state(&connection, ConnectionState::Closing).await;
        events
            .send(TransportEvent::new(
                1,
                TransportEventKind::Closed {
                    code: 1000,
                    reason: String::new(),
                    clean: true,
                },
            ))
            .unwrap();
        wait_for_state(&connection, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.opened(), vec![1]);

        connection.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_call_swept_after_pending_timeout() {
        let config = test_config().with_pending_timeout(Some(Duration::from_millis(20)));
        let (connection, transport, events) = spawn_mock(config);
        open(&connection, &transport, &events).await;

        connection.call_method("loader_tool", vec![]).unwrap();
        assert_eq!(connection.pending_calls().await.unwrap(), vec![1]);

        timeout(TEST_TIMEOUT, async {
            while !connection.pending_calls().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Pending call was never swept");
        assert!(connection.is_connected());

        drop(events);
        connection.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail() {
        let (connection, _transport, _events) = spawn_mock(test_config());
        let commands = connection.commands.clone();
        connection.shutdown().await.unwrap();

        assert!(commands.send(Command::Connect).is_err());
    }
}
