//! Ayon RPC Library
//!
//! Client side of the editor's link to the Ayon pipeline server:
//!
//! - `ipc` - WebSocket connection, call correlation and dispatch
//! - `protocol` - JSON-RPC 2.0 message types
//! - `config` - endpoint and reconnect settings from the environment
//!
//! ```ignore
//! use ayon_rpc::{ClientConfig, Connection};
//!
//! let connection = Connection::create(ClientConfig::from_env()?);
//! connection.connect()?;
//! ```

pub mod config;
pub mod ipc;
pub mod protocol;

pub use config::{ClientConfig, ReconnectPolicy};
pub use ipc::{Connection, ConnectionState, IpcError, Reply};
