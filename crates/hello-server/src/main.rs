//! Reference "hello-world" MCP server for McpFleet.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and offers three tools:
//!
//! - `ping`:          pong with a timestamp
//! - `echo`:          return the arguments
//! - `fs.read_text`:  read a text file from the allowed directory
//!
//! and one resource, `hello://about`.
//!
//! Usage (normally launched by the fleet from an `mcp.json` entry):
//!   { "mcpServers": { "hello": { "command": "mf-hello-server" } } }
//!
//! Env vars:
//!   MF_ALLOWED_DIR   directory allowed for fs.read_text (default: ".")
//!   RUST_LOG         log filter; logs go to stderr

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use mf_mcp_client::protocol::{
    error_codes, Implementation, JsonRpcError, ListChangedCapability, McpResource, McpToolDef, ReadResourceResult,
    ResourceContents, ResourcesCapability, ServerCapabilities, ToolCallContent, ToolCallResult,
};
use mf_mcp_client::server::{rpc_error, serve_stdio, McpServerHandler};

/// Larger files are cut and flagged.
const MAX_TEXT_BYTES: usize = 64 * 1024;

const ABOUT_URI: &str = "hello://about";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol, so logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let allowed_dir = PathBuf::from(std::env::var("MF_ALLOWED_DIR").unwrap_or_else(|_| ".".into()));
    tracing::info!(allowed_dir = %allowed_dir.display(), "hello server starting");

    serve_stdio(Arc::new(HelloServer { allowed_dir })).await?;

    tracing::info!("stdin closed, hello server exiting");
    Ok(())
}

struct HelloServer {
    allowed_dir: PathBuf,
}

#[async_trait]
impl McpServerHandler for HelloServer {
    fn server_info(&self) -> Implementation {
        Implementation {
            name: "mf-hello-server".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }

    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ListChangedCapability::default()),
            resources: Some(ResourcesCapability::default()),
            ..ServerCapabilities::default()
        }
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>, JsonRpcError> {
        Ok(vec![
            McpToolDef {
                name: "ping".into(),
                description: "Reply with pong and a timestamp".into(),
                input_schema: json!({ "type": "object", "properties": {} }),
            },
            McpToolDef {
                name: "echo".into(),
                description: "Echo arguments back".into(),
                input_schema: json!({ "type": "object", "additionalProperties": true }),
            },
            McpToolDef {
                name: "fs.read_text".into(),
                description: "Read a text file from the allowed directory".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "path": { "type": "string", "description": "Relative file path" } },
                    "required": ["path"]
                }),
            },
        ])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, JsonRpcError> {
        tracing::info!(tool = %name, "tool call");
        match name {
            "ping" => Ok(json_result(json!({
                "pong": true,
                "timestamp": Utc::now().timestamp_millis(),
            }))),
            "echo" => Ok(json_result(arguments)),
            "fs.read_text" => {
                let path = arguments.get("path").and_then(Value::as_str).unwrap_or("");
                if path.is_empty() {
                    return Ok(tool_error("missing 'path' argument"));
                }
                Ok(match read_text(&self.allowed_dir, path) {
                    Ok(content) => ToolCallResult {
                        content: vec![ToolCallContent::text(content)],
                        is_error: false,
                    },
                    Err(message) => tool_error(message),
                })
            }
            other => Err(rpc_error(error_codes::INVALID_PARAMS, format!("unknown tool: {other}"))),
        }
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>, JsonRpcError> {
        Ok(vec![McpResource {
            uri: ABOUT_URI.into(),
            name: "About".into(),
            description: Some("What this server is".into()),
            mime_type: Some("text/plain".into()),
        }])
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, JsonRpcError> {
        if uri != ABOUT_URI {
            return Err(rpc_error(error_codes::INVALID_PARAMS, format!("unknown resource: {uri}")));
        }
        Ok(ReadResourceResult {
            contents: vec![ResourceContents {
                uri: ABOUT_URI.into(),
                mime_type: Some("text/plain".into()),
                text: Some(format!("mf-hello-server {}", env!("CARGO_PKG_VERSION"))),
                blob: None,
            }],
        })
    }
}

fn json_result(value: Value) -> ToolCallResult {
    ToolCallResult {
        content: vec![ToolCallContent::text(value.to_string())],
        is_error: false,
    }
}

fn tool_error(message: impl Into<String>) -> ToolCallResult {
    ToolCallResult {
        content: vec![ToolCallContent::text(message)],
        is_error: true,
    }
}

/// Read `relative` under `allowed_dir`, refusing paths that escape it.
fn read_text(allowed_dir: &Path, relative: &str) -> Result<String, String> {
    let canonical_dir = allowed_dir
        .canonicalize()
        .map_err(|e| format!("allowed dir error: {e}"))?;
    let canonical_file = allowed_dir
        .join(relative)
        .canonicalize()
        .map_err(|e| format!("file not found: {e}"))?;
    if !canonical_file.starts_with(&canonical_dir) {
        return Err("path traversal outside allowed directory".into());
    }

    let content = std::fs::read_to_string(&canonical_file).map_err(|e| format!("read error: {e}"))?;
    if content.len() <= MAX_TEXT_BYTES {
        return Ok(content);
    }
    let mut end = MAX_TEXT_BYTES;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    Ok(format!("{}...\n[truncated: {} bytes total]", &content[..end], content.len()))
}
