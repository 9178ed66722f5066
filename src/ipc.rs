//! Persistent JSON-RPC 2.0 link to the Ayon pipeline server.
//!
//! The editor keeps one WebSocket open to the local pipeline server and
//! uses it to invoke pipeline tools by name (`loader_tool`, `publish_tool`,
//! ...). Calls are fire-and-forget: replies arrive later and are correlated
//! by id.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ commands ┌─────────────────────────────┐  text   ┌────────────┐
//! │  Connection  │─────────►│ coordinator task            │────────►│            │
//! │   (handle)   │◄─────────│  Dispatcher                 │         │  pipeline  │
//! └──────────────┘ replies, │   ├─ ConnectionManager      │◄────────│   server   │
//!                  state    │   │   └─ WebSocketTransport │ events  │            │
//!                           │   └─ CallRegistry           │         └────────────┘
//!                           └─────────────────────────────┘
//! ```
//!
//! # Protocol
//!
//! One JSON document per text frame, no extra framing:
//!
//! ```text
//! → {"jsonrpc":"2.0","method":"loader_tool","params":[],"id":1}
//! ← {"jsonrpc":"2.0","result":"ok","id":1}
//! ← {"jsonrpc":"2.0","error":{"code":-32601,"message":"Method not found"},"id":2}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ayon_rpc::{ClientConfig, Connection};
//!
//! let connection = Connection::create(ClientConfig::from_env()?);
//! let mut replies = connection.subscribe();
//! connection.connect()?;
//! connection.call_method("loader_tool", vec![])?;
//! let reply = replies.recv().await?;
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod registry;
pub mod transport;

pub use client::{Connection, IpcError};
pub use codec::{decode, encode, DecodedMessage};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::{Dispatcher, Reply};
pub use registry::{CallRegistry, PendingCall};
pub use transport::{Transport, TransportEvent, TransportEventKind, WebSocketTransport};
