//! JSON-RPC 2.0 wire types exchanged with the Ayon pipeline server.
//!
//! The shapes are deliberately narrow: call parameters are a flat list of
//! strings and results are strings, matching what the editor-side tools send
//! and what the server answers.

use serde::{Deserialize, Serialize};

/// Protocol version carried in every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation id of a call.
pub type CallId = u64;

/// Outbound method invocation.
///
/// Field order is the wire order: `jsonrpc`, `method`, `params`, `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCall {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<String>,
    pub id: CallId,
}

impl RpcCall {
    /// Build a 2.0 call for `method` with positional string arguments.
    pub fn new(method: impl Into<String>, params: Vec<String>, id: CallId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// Error object of a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// JSON-RPC error code (e.g. -32601 for "Method not found")
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: String,
}

/// Successful reply correlated to a prior call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponseResult {
    pub jsonrpc: String,
    pub result: String,
    pub id: CallId,
}

/// Failed reply correlated to a prior call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponseError {
    pub jsonrpc: String,
    pub error: RpcError,
    pub id: CallId,
}
