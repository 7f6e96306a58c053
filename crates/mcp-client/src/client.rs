//! Protocol client: one MCP session over one transport.
//!
//! Requests are correlated by id, never by arrival order. A pending entry is
//! registered before the frame is written and removed exactly once, by the
//! matching response, a fatal transport error, cancellation, or timeout.
//! Writes go through a single-slot gate so frames never interleave; waiting
//! for the response happens outside the gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::McpError;
use crate::protocol::{
    self, error_codes, methods, CallToolParams, ClientCapabilities, Implementation, InitializeResult,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpResource, McpToolDef,
    ReadResourceParams, ReadResourceResult, ResourcesListResult, ServerCapabilities, ToolCallResult,
    ToolsListResult,
};
use crate::transport::{Transport, TransportError, TransportEvent, EVENT_CHANNEL_CAPACITY};

/// Upper bound on `tools/list` / `resources/list` pages followed.
const MAX_LIST_PAGES: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options and events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    /// Applied to every request that does not bring its own deadline.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::default(),
            capabilities: ClientCapabilities::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Published on the client's broadcast channel.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    CapabilitiesReceived(ServerCapabilities),
    Notification(JsonRpcNotification),
    TransportError { message: String, fatal: bool },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum PendingOutcome {
    Response(JsonRpcResponse),
    Failed(String),
}

type PendingTable = parking_lot::Mutex<HashMap<String, oneshot::Sender<PendingOutcome>>>;

struct ClientShared {
    transport: Box<dyn Transport>,
    pending: PendingTable,
    next_id: AtomicU64,
    send_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ClientEvent>,
    closed: AtomicBool,
}

impl ClientShared {
    async fn write(&self, message: &JsonRpcMessage, cancel: &CancellationToken) -> Result<(), TransportError> {
        let _gate = tokio::select! {
            gate = self.send_gate.lock() => gate,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };
        self.transport.send(message, cancel).await
    }

    fn resolve(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.as_ref() else {
            if let Some(err) = &response.error {
                tracing::warn!(error = %err, "MCP server sent an error without a request id");
            }
            return;
        };
        let key = id.key();
        let entry = self.pending.lock().remove(&key);
        match entry {
            Some(tx) => {
                let _ = tx.send(PendingOutcome::Response(response));
            }
            None => tracing::debug!(id = %key, "dropping response for unknown or abandoned request"),
        }
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), reason = %reason, "failing pending MCP requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(PendingOutcome::Failed(reason.to_string()));
        }
    }

    /// Reply to a request the server sent us. Runs off the dispatch path.
    fn answer(self: &Arc<Self>, request: JsonRpcRequest) {
        let reply = if request.method == methods::PING {
            JsonRpcResponse::success(request.id, serde_json::json!({}))
        } else {
            tracing::debug!(method = %request.method, "rejecting unsupported server request");
            JsonRpcResponse::failure(
                Some(request.id),
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            )
        };
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let message = JsonRpcMessage::from(reply);
            if let Err(e) = shared.write(&message, &CancellationToken::new()).await {
                tracing::debug!(error = %e, "failed to answer server request");
            }
        });
    }
}

/// Removes the pending entry however the request ends.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

async fn dispatch_loop(shared: Weak<ClientShared>, mut inbound: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = inbound.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(JsonRpcMessage::Response(response)) => shared.resolve(response),
            TransportEvent::Message(JsonRpcMessage::Notification(notification)) => {
                tracing::trace!(method = %notification.method, "MCP notification");
                let _ = shared.events.send(ClientEvent::Notification(notification));
            }
            TransportEvent::Message(JsonRpcMessage::Request(request)) => shared.answer(request),
            TransportEvent::Error(e) => {
                let fatal = e.is_fatal();
                if fatal {
                    tracing::warn!(transport = shared.transport.kind(), error = %e, "MCP transport failed");
                    shared.fail_pending(&e.to_string());
                } else {
                    tracing::debug!(transport = shared.transport.kind(), error = %e, "MCP transport fault");
                }
                let _ = shared.events.send(ClientEvent::TransportError {
                    message: e.to_string(),
                    fatal,
                });
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.fail_pending("transport stopped delivering messages");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC session with one MCP server.
pub struct McpClient {
    shared: Arc<ClientShared>,
    options: ClientOptions,
    server: parking_lot::Mutex<Option<InitializeResult>>,
    dispatch: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl McpClient {
    /// Wrap an unconnected transport. Call [`connect`](Self::connect) next.
    pub fn new(transport: Box<dyn Transport>, options: ClientOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(ClientShared {
                transport,
                pending: parking_lot::Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                send_gate: tokio::sync::Mutex::new(()),
                events,
                closed: AtomicBool::new(false),
            }),
            options,
            server: parking_lot::Mutex::new(None),
            dispatch: parking_lot::Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Connect the transport and run the `initialize` handshake.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<InitializeResult, McpError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        if self.dispatch.lock().is_some() {
            return Err(TransportError::AlreadyConnected.into());
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.shared.transport.connect(tx, cancel).await?;
        let task = tokio::spawn(dispatch_loop(Arc::downgrade(&self.shared), rx));
        *self.dispatch.lock() = Some(task);

        let params = protocol::initialize_params(
            self.options.capabilities.clone(),
            self.options.client_info.clone(),
        );
        let params = serde_json::to_value(params).map_err(TransportError::from)?;
        let result: InitializeResult = self.request(methods::INITIALIZE, Some(params), cancel).await?;

        tracing::debug!(
            transport = self.shared.transport.kind(),
            protocol_version = %result.protocol_version,
            server = ?result.server_info.as_ref().map(|i| i.name.as_str()),
            "MCP initialize response received"
        );
        let _ = self
            .shared
            .events
            .send(ClientEvent::CapabilitiesReceived(result.capabilities.clone()));

        self.notify(methods::INITIALIZED, None, cancel).await?;
        *self.server.lock() = Some(result.clone());
        Ok(result)
    }

    /// Capabilities negotiated during the handshake.
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.server.lock().as_ref().map(|r| r.capabilities.clone())
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.server.lock().as_ref().and_then(|r| r.server_info.clone())
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) && self.shared.transport.is_connected()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    // ── Generic request path ───────────────────────────────────────

    /// Send a request and decode its result, using the default timeout.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<T, McpError> {
        self.request_within(method, params, self.options.request_timeout, cancel)
            .await
    }

    /// Send a request and decode its result within `timeout`.
    pub async fn request_within<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, McpError> {
        let value = self.request_value(method, params, timeout, cancel).await?;
        serde_json::from_value(value).map_err(|source| McpError::Decode {
            method: method.to_string(),
            source,
        })
    }

    async fn request_value(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed).to_string();

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            key: id.clone(),
        };

        let message = JsonRpcMessage::from(JsonRpcRequest::new(id.as_str(), method, params));
        let sent = tokio::select! {
            r = self.shared.write(&message, cancel) => r,
            _ = tokio::time::sleep_until(deadline) => return Err(self.timed_out(method, timeout)),
        };
        match sent {
            Ok(()) => {}
            Err(TransportError::Cancelled) => return Err(McpError::Cancelled { method: method.to_string() }),
            Err(e) => return Err(e.into()),
        }

        let outcome = tokio::select! {
            outcome = rx => outcome,
            _ = cancel.cancelled() => {
                self.send_cancelled(&id, "cancelled by caller");
                return Err(McpError::Cancelled { method: method.to_string() });
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.send_cancelled(&id, "request timed out");
                return Err(self.timed_out(method, timeout));
            }
        };

        match outcome {
            Ok(PendingOutcome::Response(response)) => response
                .into_result()
                .map_err(|err| McpError::protocol(method, err)),
            Ok(PendingOutcome::Failed(reason)) => Err(McpError::ConnectionLost {
                method: method.to_string(),
                reason,
            }),
            Err(_) => Err(McpError::ConnectionLost {
                method: method.to_string(),
                reason: "client dropped the request".into(),
            }),
        }
    }

    fn timed_out(&self, method: &str, timeout: Duration) -> McpError {
        tracing::warn!(method = %method, timeout_ms = timeout.as_millis() as u64, "MCP request timed out");
        McpError::Timeout {
            method: method.to_string(),
            timeout,
        }
    }

    /// Tell the server we gave up on a request. Best effort.
    fn send_cancelled(&self, id: &str, reason: &str) {
        let notification = JsonRpcNotification::new(methods::CANCELLED)
            .with_params(serde_json::json!({ "requestId": id, "reason": reason }));
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let message = JsonRpcMessage::from(notification);
            let _ = shared.write(&message, &CancellationToken::new()).await;
        });
    }

    /// Send a notification through the send gate.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<(), McpError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed);
        }
        let mut notification = JsonRpcNotification::new(method);
        notification.params = params;
        let message = JsonRpcMessage::from(notification);
        match self.shared.write(&message, cancel).await {
            Ok(()) => Ok(()),
            Err(TransportError::Cancelled) => Err(McpError::Cancelled { method: method.to_string() }),
            Err(e) => Err(e.into()),
        }
    }

    // ── MCP operations ─────────────────────────────────────────────

    pub async fn ping(&self, cancel: &CancellationToken) -> Result<(), McpError> {
        let _: Value = self.request(methods::PING, None, cancel).await?;
        Ok(())
    }

    /// `tools/list`, following pagination cursors.
    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<McpToolDef>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let page: ToolsListResult = self.request(methods::TOOLS_LIST, params, cancel).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResult, McpError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let params = serde_json::to_value(params).map_err(TransportError::from)?;
        self.request(methods::TOOLS_CALL, Some(params), cancel).await
    }

    /// `resources/list`, following pagination cursors.
    pub async fn list_resources(&self, cancel: &CancellationToken) -> Result<Vec<McpResource>, McpError> {
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let page: ResourcesListResult = self.request(methods::RESOURCES_LIST, params, cancel).await?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(resources)
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<ReadResourceResult, McpError> {
        let params = serde_json::to_value(ReadResourceParams { uri: uri.to_string() })
            .map_err(TransportError::from)?;
        self.request(methods::RESOURCES_READ, Some(params), cancel).await
    }

    /// Disconnect the transport. Only the first call does anything.
    ///
    /// Requests still pending fail with [`McpError::ConnectionLost`].
    pub async fn close(&self) -> Result<(), McpError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.dispatch.lock().take() {
            task.abort();
        }
        self.shared.fail_pending("client closed");
        self.shared.transport.disconnect().await?;
        tracing::debug!(transport = self.shared.transport.kind(), "MCP client closed");
        Ok(())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch.get_mut().take() {
            task.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
