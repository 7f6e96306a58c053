//! MCP transport layer.
//!
//! A transport moves whole JSON-RPC frames. It does not correlate requests
//! with responses; that is the protocol client's job. Inbound frames and
//! transport faults are pushed into the event channel handed over at
//! [`Transport::connect`].
//!
//! Implementations:
//! - **Stdio**: spawn a child process, newline-delimited JSON over stdin/stdout.
//! - **Sse**: HTTP event stream for inbound frames, POST for outbound frames.
//! - **InProcess**: channel pair for servers hosted in the same process.

pub mod memory;
pub mod sse;
pub mod stdio;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mf_domain::config::{ServerConfig, TransportKind};

use crate::error::McpError;
use crate::protocol::JsonRpcMessage;

pub use memory::{InProcessServerEnd, InProcessTransport};
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Buffer size of the inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something a transport observed on its own.
#[derive(Debug)]
pub enum TransportEvent {
    Message(JsonRpcMessage),
    Error(TransportError),
}

/// Sending half of the inbound event channel.
pub type EventSender = mpsc::Sender<TransportEvent>;

/// Trait for MCP server transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel. Inbound frames and faults are pushed into `events`
    /// until [`disconnect`](Transport::disconnect) is called.
    async fn connect(&self, events: EventSender, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Write one frame.
    async fn send(&self, message: &JsonRpcMessage, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Close the channel. Waits are bounded; resources are released even if
    /// the peer never confirms.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Check if the transport is still usable.
    fn is_connected(&self) -> bool;

    /// Short name for logs.
    fn kind(&self) -> &'static str;
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("MCP server process has exited (code {code:?}){}", stderr_suffix(.stderr))]
    ProcessExited { code: Option<i32>, stderr: String },

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("malformed frame: {reason}")]
    Malformed { frame: String, reason: String },

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport is already connected")]
    AlreadyConnected,

    #[error("operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Whether the connection is gone for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProcessExited { .. } | Self::ConnectionClosed(_)
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builds a transport for a server configuration.
///
/// Server instances call this every time they start, so each start gets a
/// fresh, unconnected transport.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, McpError>;
}

/// Selects stdio or SSE from the configuration.
#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory {
    http: reqwest::Client,
}

impl DefaultTransportFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, McpError> {
        let transport: Box<dyn Transport> = match config.transport_kind()? {
            TransportKind::Stdio => Box::new(StdioTransport::from_config(config)),
            TransportKind::Streaming => {
                let url = config.url.as_deref().unwrap_or_default();
                Box::new(SseTransport::new(url, self.http.clone())?)
            }
        };
        tracing::debug!(
            server_id = %config.server_id,
            transport = transport.kind(),
            "selected MCP transport"
        );
        Ok(transport)
    }
}

/// Build the transport a configuration asks for.
pub fn select_transport(config: &ServerConfig) -> Result<Box<dyn Transport>, McpError> {
    DefaultTransportFactory::default().create(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_selects_stdio() {
        let cfg = ServerConfig::new("a").with_command("node", ["server.js"]);
        assert_eq!(select_transport(&cfg).unwrap().kind(), "stdio");
    }

    #[test]
    fn url_selects_sse() {
        let cfg = ServerConfig::new("b").with_url("http://127.0.0.1:9/sse");
        assert_eq!(select_transport(&cfg).unwrap().kind(), "sse");
    }

    #[test]
    fn both_prefers_stdio_unless_hinted() {
        let mut cfg = ServerConfig::new("c")
            .with_command("node", ["server.js"])
            .with_url("http://127.0.0.1:9/sse");
        assert_eq!(select_transport(&cfg).unwrap().kind(), "stdio");
        cfg.transport = Some("sse".into());
        assert_eq!(select_transport(&cfg).unwrap().kind(), "sse");
    }

    #[test]
    fn nothing_to_connect_with_is_a_config_error() {
        let cfg = ServerConfig::new("d");
        assert!(matches!(select_transport(&cfg), Err(McpError::Config(_))));
    }

    #[test]
    fn fatal_errors() {
        assert!(TransportError::ProcessExited { code: Some(1), stderr: String::new() }.is_fatal());
        assert!(TransportError::ConnectionClosed("eof".into()).is_fatal());
        assert!(!TransportError::Malformed { frame: "x".into(), reason: "y".into() }.is_fatal());
    }

    #[test]
    fn process_exit_message_includes_stderr() {
        let err = TransportError::ProcessExited {
            code: Some(2),
            stderr: "missing module".into(),
        };
        assert_eq!(
            err.to_string(),
            "MCP server process has exited (code Some(2)): missing module"
        );
    }
}
