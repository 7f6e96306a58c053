use std::time::Duration;

use mf_domain::error::ConfigError;

use crate::events::ServerStatus;
use crate::protocol::JsonRpcError;
use crate::transport::TransportError;

/// Errors specific to MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server answered with a JSON-RPC error object.
    #[error("MCP server error {code} on '{method}': {message}")]
    Protocol {
        method: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("failed to decode '{method}' result: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("request '{method}' was cancelled")]
    Cancelled { method: String },

    #[error("request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The connection failed while the request was pending.
    #[error("connection lost while waiting for '{method}': {reason}")]
    ConnectionLost { method: String, reason: String },

    #[error("MCP client is closed")]
    Closed,

    #[error("MCP server '{server_id}' is {status}, expected {expected}")]
    InvalidState {
        server_id: String,
        status: ServerStatus,
        expected: ServerStatus,
    },

    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    #[error("MCP server already registered: {0}")]
    AlreadyRegistered(String),

    /// A stop arrived while the instance was starting.
    #[error("start of MCP server '{0}' was superseded by a stop")]
    Superseded(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl McpError {
    pub(crate) fn protocol(method: &str, err: JsonRpcError) -> Self {
        Self::Protocol {
            method: method.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
