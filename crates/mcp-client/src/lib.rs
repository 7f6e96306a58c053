//! `mf-mcp-client`: manage a fleet of MCP (Model Context Protocol) servers.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types and a correlating protocol client.
//! - stdio (child process) and SSE transports, plus an in-process pair for tests.
//! - `ServerInstance`, the per-server lifecycle state machine.
//! - `FleetManager`, which registers instances, sweeps their health and
//!   restarts them per policy.
//! - Discovery and persistence of `mcp.json` configuration files.
//! - `McpToolBridge`, which exposes server tools to a language model behind
//!   risk policy and approval.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mf_mcp_client::{FleetManager, FleetOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let fleet = FleetManager::new(FleetOptions::default());
//! let configs = fleet.discover_servers(None).await;
//! fleet.start_auto_start_servers(&configs).await;
//!
//! let cancel = CancellationToken::new();
//! for server in fleet.get_all_tools(&cancel).await {
//!     for tool in server.tools {
//!         println!("{}: {}", server.server_id, tool.name);
//!     }
//! }
//!
//! fleet.shutdown().await;
//! ```

pub mod backoff;
pub mod bridge;
pub mod client;
pub mod error;
pub mod events;
pub mod instance;
pub mod jsonc;
pub mod loader;
pub mod manager;
pub mod paths;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-exports for convenience.
pub use bridge::{ApprovalDecision, ApprovalProvider, McpToolBridge, RiskPolicy, ToolOutput, ToolSchemaSink};
pub use client::{ClientOptions, McpClient};
pub use error::McpError;
pub use events::{FleetEvent, ServerStatus};
pub use instance::{ServerInstance, ServerSummary};
pub use manager::{FleetManager, FleetOptions};
pub use protocol::McpToolDef;
pub use transport::{Transport, TransportError, TransportFactory};
