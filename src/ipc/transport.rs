//! Socket transport and its event stream.
//!
//! A [`Transport`] opens one socket per connection attempt and reports what
//! happens to it as [`TransportEvent`]s on a single channel. Every event is
//! tagged with the attempt it belongs to so the connection manager can drop
//! events from attempts it has already given up on.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::ipc::client::IpcError;
use crate::ipc::codec::MAX_MESSAGE_SIZE;

/// Close code reported when the socket went away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code reported for a close frame that carried no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// How long the server has to answer our close frame.
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// What happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Handshake completed.
    Opened,
    /// The attempt failed before the handshake completed.
    ConnectionError(String),
    /// The socket closed after (or while) opening.
    Closed {
        code: u16,
        reason: String,
        clean: bool,
    },
    /// One inbound frame payload.
    Message(Vec<u8>),
    /// One outbound frame was written.
    Sent(String),
}

/// Event tagged with the connection attempt that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub attempt: u64,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(attempt: u64, kind: TransportEventKind) -> Self {
        Self { attempt, kind }
    }
}

/// Sending half of the event channel handed to transports.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Low-level socket operations driven by the connection manager.
///
/// Implementations must not block: results of `open` and `close` are
/// reported later as events.
pub trait Transport: Send {
    /// Start connection attempt `attempt`, replacing any previous socket.
    fn open(&mut self, attempt: u64);

    /// Queue one text frame on the open socket.
    fn send(&mut self, text: String) -> Result<(), IpcError>;

    /// Begin closing the socket (or abandon a handshake in progress).
    fn close(&mut self);
}

/// Command for the socket task.
#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// The one live socket task and its command queue.
struct SocketSlot {
    attempt: u64,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    task: JoinHandle<()>,
}

/// WebSocket transport built on `tokio-tungstenite`.
///
/// Each attempt runs in its own task that owns the socket. Reconnecting
/// reuses the single slot: the previous task is aborted before a new one
/// starts. Must be used from within a tokio runtime.
pub struct WebSocketTransport {
    url: Url,
    events: EventSender,
    slot: Option<SocketSlot>,
}

impl WebSocketTransport {
    pub fn new(url: Url, events: EventSender) -> Self {
        Self {
            url,
            events,
            slot: None,
        }
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self, attempt: u64) {
        if let Some(previous) = self.slot.take() {
            tracing::debug!(
                previous = previous.attempt,
                attempt,
                "Replacing socket from superseded attempt"
            );
            previous.task.abort();
        }

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(
            self.url.to_string(),
            attempt,
            self.events.clone(),
            outgoing_rx,
        ));

        self.slot = Some(SocketSlot {
            attempt,
            outgoing,
            task,
        });
    }

    fn send(&mut self, text: String) -> Result<(), IpcError> {
        let slot = self
            .slot
            .as_ref()
            .ok_or_else(|| IpcError::Transport("No socket has been opened".to_string()))?;

        slot.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| IpcError::Transport("Socket task has exited".to_string()))
    }

    fn close(&mut self) {
        let Some(slot) = self.slot.as_ref() else {
            return;
        };

        // A task that already exited can no longer confirm the close
        if slot.outgoing.send(Outgoing::Close).is_err() {
            emit(
                &self.events,
                slot.attempt,
                TransportEventKind::Closed {
                    code: ABNORMAL_CLOSURE,
                    reason: "Socket task has exited".to_string(),
                    clean: false,
                },
            );
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.task.abort();
        }
    }
}

fn emit(events: &EventSender, attempt: u64, kind: TransportEventKind) {
    // Receiver gone means the coordinator is shutting down
    let _ = events.send(TransportEvent::new(attempt, kind));
}

/// Socket task for one attempt: handshake, then pump frames both ways.
async fn run_socket(
    url: String,
    attempt: u64,
    events: EventSender,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    tracing::debug!(attempt, url = %url, "Opening WebSocket");

    // Only a close request can arrive before the handshake completes
    let handshake = tokio::select! {
        result = connect_async_with_config(url.as_str(), Some(socket_config()), false) => result,
        _ = outgoing.recv() => {
            emit(
                &events,
                attempt,
                TransportEventKind::Closed {
                    code: u16::from(CloseCode::Normal),
                    reason: "Closed before handshake completed".to_string(),
                    clean: false,
                },
            );
            return;
        }
    };

    let socket = match handshake {
        Ok((socket, _response)) => socket,
        Err(e) => {
            let reason = IpcError::from(e).to_string();
            emit(&events, attempt, TransportEventKind::ConnectionError(reason));
            return;
        }
    };

    emit(&events, attempt, TransportEventKind::Opened);

    let (mut sink, mut stream) = socket.split();
    // Set once our close frame is queued
    let mut close_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            command = outgoing.recv(), if close_deadline.is_none() => match command {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.clone().into())).await {
                        emit(&events, attempt, abnormal(e.to_string()));
                        return;
                    }
                    emit(&events, attempt, TransportEventKind::Sent(text));
                }
                Some(Outgoing::Close) | None => {
                    let deadline = Instant::now() + CLOSE_HANDSHAKE_TIMEOUT;
                    close_deadline = Some(deadline);
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: String::new().into(),
                    };
                    match timeout_at(deadline, sink.send(Message::Close(Some(frame)))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            emit(&events, attempt, abnormal(e.to_string()));
                            return;
                        }
                        Err(_) => {
                            emit(&events, attempt, abnormal("Timed out sending close frame".to_string()));
                            return;
                        }
                    }
                }
            },
            _ = sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                emit(&events, attempt, abnormal("Server did not answer close frame".to_string()));
                return;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    emit(&events, attempt, TransportEventKind::Message(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Binary(data))) => {
                    emit(&events, attempt, TransportEventKind::Message(data.to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    if close_deadline.is_none() {
                        // Flush the close reply tungstenite queued for us
                        let _ = sink.close().await;
                    }
                    emit(&events, attempt, TransportEventKind::Closed { code, reason, clean: true });
                    return;
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(&events, attempt, abnormal(e.to_string()));
                    return;
                }
                None => {
                    emit(&events, attempt, abnormal("Connection closed without close frame".to_string()));
                    return;
                }
            },
        }
    }
}

/// Handshake settings; oversized inbound messages fail the socket before
/// they are buffered in full.
fn socket_config() -> WebSocketConfig {
    WebSocketConfig::default().max_message_size(Some(MAX_MESSAGE_SIZE))
}

fn abnormal(reason: String) -> TransportEventKind {
    TransportEventKind::Closed {
        code: ABNORMAL_CLOSURE,
        reason,
        clean: false,
    }
}

/// In-memory transport recording what the connection manager asked for.
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Default)]
    pub struct MockLog {
        pub opened: Vec<u64>,
        pub sent: Vec<String>,
        pub closes: usize,
        pub fail_sends: bool,
    }

    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub log: Arc<Mutex<MockLog>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<String> {
            self.log.lock().unwrap().sent.clone()
        }

        pub fn opened(&self) -> Vec<u64> {
            self.log.lock().unwrap().opened.clone()
        }

        pub fn closes(&self) -> usize {
            self.log.lock().unwrap().closes
        }

        pub fn fail_sends(&self) {
            self.log.lock().unwrap().fail_sends = true;
        }
    }

    impl Transport for MockTransport {
        fn open(&mut self, attempt: u64) {
            self.log.lock().unwrap().opened.push(attempt);
        }

        fn send(&mut self, text: String) -> Result<(), IpcError> {
            let mut log = self.log.lock().unwrap();
            if log.fail_sends {
                return Err(IpcError::Transport("Socket task has exited".to_string()));
            }
            log.sent.push(text);
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_send_before_open_is_error() {
        let (events, _events_rx) = mpsc::unbounded_channel();
        let url = Url::parse("ws://127.0.0.1:9").unwrap();
        let mut transport = WebSocketTransport::new(url, events);

        let result = transport.send("{}".to_string());
        assert!(matches!(result, Err(IpcError::Transport(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_for_attempt() {
        // Bind then drop a listener to get a port nobody is listening on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events, mut events_rx) = mpsc::unbounded_channel();
        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        let mut transport = WebSocketTransport::new(url, events);
        transport.open(7);

        let event = timeout(TEST_TIMEOUT, events_rx.recv())
            .await
            .expect("Test timed out")
            .expect("Event channel closed");

        assert_eq!(event.attempt, 7);
        assert!(
            matches!(event.kind, TransportEventKind::ConnectionError(_)),
            "Expected ConnectionError, got: {:?}",
            event.kind
        );
    }

    #[test]
    fn test_socket_config_limits_message_size() {
        assert_eq!(socket_config().max_message_size, Some(MAX_MESSAGE_SIZE));
    }

    #[test]
    fn test_abnormal_close_kind() {
        assert_eq!(
            abnormal("reset".to_string()),
            TransportEventKind::Closed {
                code: ABNORMAL_CLOSURE,
                reason: "reset".to_string(),
                clean: false,
            }
        );
    }
}
