//! Minimal server-side dispatch.
//!
//! Enough of the server half of the protocol to host tools in-process
//! ([`serve_in_process`]) or behind stdio ([`serve_stdio`]), which is how
//! the reference `mf-hello-server` binary is built.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mf_domain::config::ServerConfig;
use mf_domain::error::ConfigError;

use crate::error::McpError;
use crate::protocol::{
    error_codes, methods, CallToolParams, Implementation, InitializeResult, JsonRpcError,
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, McpResource, McpToolDef,
    ReadResourceParams, ReadResourceResult, ResourcesListResult, ServerCapabilities,
    ToolCallResult, ToolsListResult, JSONRPC_VERSION, PROTOCOL_VERSION,
};
use crate::transport::{InProcessServerEnd, InProcessTransport, Transport, TransportFactory};

/// Tools and resources exposed by a server.
#[async_trait]
pub trait McpServerHandler: Send + Sync + 'static {
    fn server_info(&self) -> Implementation;

    fn capabilities(&self) -> ServerCapabilities;

    async fn list_tools(&self) -> Result<Vec<McpToolDef>, JsonRpcError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, JsonRpcError>;

    async fn list_resources(&self) -> Result<Vec<McpResource>, JsonRpcError> {
        Ok(Vec::new())
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, JsonRpcError> {
        Err(rpc_error(error_codes::INVALID_PARAMS, format!("unknown resource: {uri}")))
    }
}

pub fn rpc_error(code: i64, message: impl Into<String>) -> JsonRpcError {
    JsonRpcError {
        code,
        message: message.into(),
        data: None,
    }
}

/// Route one request to the handler.
pub async fn handle_request<H>(handler: &H, request: JsonRpcRequest) -> JsonRpcResponse
where
    H: McpServerHandler + ?Sized,
{
    let id = request.id.clone();
    let result = route(handler, request).await;
    match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(error) => JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id),
            result: None,
            error: Some(error),
        },
    }
}

async fn route<H>(handler: &H, request: JsonRpcRequest) -> Result<Value, JsonRpcError>
where
    H: McpServerHandler + ?Sized,
{
    match request.method.as_str() {
        methods::INITIALIZE => to_value(InitializeResult {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: handler.capabilities(),
            server_info: Some(handler.server_info()),
            instructions: None,
        }),
        methods::PING => Ok(serde_json::json!({})),
        methods::TOOLS_LIST => to_value(ToolsListResult {
            tools: handler.list_tools().await?,
            next_cursor: None,
        }),
        methods::TOOLS_CALL => {
            let params: CallToolParams = params(request.params)?;
            to_value(handler.call_tool(&params.name, params.arguments).await?)
        }
        methods::RESOURCES_LIST => to_value(ResourcesListResult {
            resources: handler.list_resources().await?,
            next_cursor: None,
        }),
        methods::RESOURCES_READ => {
            let params: ReadResourceParams = params(request.params)?;
            to_value(handler.read_resource(&params.uri).await?)
        }
        other => Err(rpc_error(
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        )),
    }
}

fn params<T: DeserializeOwned>(raw: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(raw.unwrap_or(Value::Null))
        .map_err(|e| rpc_error(error_codes::INVALID_PARAMS, e.to_string()))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| rpc_error(error_codes::INTERNAL_ERROR, e.to_string()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serving
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serve the server end of an in-process pair until the client goes away.
///
/// Each request runs in its own task, so slow tools do not hold up fast
/// ones and responses can arrive out of order.
pub fn serve_in_process<H>(mut end: InProcessServerEnd, handler: Arc<H>) -> JoinHandle<()>
where
    H: McpServerHandler + ?Sized,
{
    tokio::spawn(async move {
        while let Some(message) = end.recv().await {
            if let JsonRpcMessage::Request(request) = message {
                let handler = handler.clone();
                let outgoing = end.outgoing.clone();
                tokio::spawn(async move {
                    let response = handle_request(handler.as_ref(), request).await;
                    let _ = outgoing.send(JsonRpcMessage::Response(response));
                });
            }
        }
    })
}

/// Serve newline-delimited JSON-RPC over the process's stdin/stdout.
pub async fn serve_stdio<H>(handler: Arc<H>) -> std::io::Result<()>
where
    H: McpServerHandler + ?Sized,
{
    serve_lines(tokio::io::stdin(), tokio::io::stdout(), handler).await
}

/// Serve newline-delimited JSON-RPC over any reader/writer pair until the
/// reader reaches end of input.
pub async fn serve_lines<R, W, H>(reader: R, mut writer: W, handler: Arc<H>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    H: McpServerHandler + ?Sized,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();

    // Writer task: one frame per line, never interleaved.
    let writer_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let json = match serde_json::to_string(&response) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode response");
                    continue;
                }
            };
            if writer.write_all(json.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match JsonRpcMessage::parse(trimmed) {
            Ok(JsonRpcMessage::Request(request)) => {
                tracing::debug!(method = %request.method, id = %request.id, "request");
                let handler = handler.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = handle_request(handler.as_ref(), request).await;
                    let _ = tx.send(response);
                });
            }
            Ok(JsonRpcMessage::Notification(n)) => {
                tracing::debug!(method = %n.method, "notification");
            }
            Ok(JsonRpcMessage::Response(_)) => {}
            Err(e) => {
                tracing::warn!(error = %e, "unparseable frame");
                let _ = tx.send(JsonRpcResponse::failure(
                    None,
                    error_codes::PARSE_ERROR,
                    format!("parse error: {e}"),
                ));
            }
        }
    }

    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transport factory that connects server ids to in-process handlers.
///
/// Every `create` spawns a fresh server task, so a restarted instance talks
/// to a new server over a new channel.
#[derive(Default)]
pub struct InProcessTransportFactory {
    handlers: parking_lot::RwLock<HashMap<String, Arc<dyn McpServerHandler>>>,
}

impl InProcessTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server_id: impl Into<String>, handler: Arc<dyn McpServerHandler>) {
        self.handlers.write().insert(server_id.into(), handler);
    }
}

impl TransportFactory for InProcessTransportFactory {
    fn create(&self, config: &ServerConfig) -> Result<Box<dyn Transport>, McpError> {
        let handler = self
            .handlers
            .read()
            .get(&config.server_id)
            .cloned()
            .ok_or_else(|| {
                ConfigError::invalid(&config.server_id, "no in-process handler registered")
            })?;
        let (transport, end) = InProcessTransport::pair();
        serve_in_process(end, handler);
        Ok(Box::new(transport))
    }
}
