//! One managed MCP server: configuration, lifecycle state, live connection.
//!
//! ```text
//! Stopped ──start──▶ Starting ──handshake ok──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                        │                         │
//!                        └──────── failure ────────┴──▶ Error ──stop──▶ Stopped
//! ```
//!
//! Every transition happens under the instance lock; no I/O is awaited while
//! the lock is held. A generation counter tags each start so that a stop
//! arriving mid-start wins: the start notices the bump and closes the
//! connection it just opened. Restarts additionally hold an async restart
//! gate across their stop and start, so two restarts never interleave.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mf_domain::config::ServerConfig;

use crate::client::{ClientEvent, ClientOptions, McpClient};
use crate::error::McpError;
use crate::events::{EventSink, FleetEvent, ServerStatus};
use crate::protocol::{
    methods, Implementation, McpResource, McpToolDef, ReadResourceResult, ServerCapabilities,
    ToolCallResult, ToolsListResult,
};
use crate::transport::TransportFactory;

/// Per-instance tuning, derived from the fleet options.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    pub client: ClientOptions,
    /// Deadline for the `tools/list` health probe.
    pub probe_timeout: Duration,
    /// How long `stop` waits for the transport to close.
    pub stop_timeout: Duration,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            probe_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub server_id: String,
    pub name: String,
    pub status: ServerStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub capabilities: Option<ServerCapabilities>,
    pub server_info: Option<Implementation>,
    pub restart_attempts: u32,
}

struct InstanceState {
    status: ServerStatus,
    client: Option<Arc<McpClient>>,
    capabilities: Option<ServerCapabilities>,
    server_info: Option<Implementation>,
    last_health_check: Option<DateTime<Utc>>,
    watcher: Option<JoinHandle<()>>,
    generation: u64,
    retired: bool,
}

pub struct ServerInstance {
    id: String,
    config: ServerConfig,
    state: parking_lot::Mutex<InstanceState>,
    factory: Arc<dyn TransportFactory>,
    events: EventSink,
    options: InstanceOptions,
    restart_attempts: AtomicU32,
    restart_gate: tokio::sync::Mutex<()>,
}

impl ServerInstance {
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn TransportFactory>,
        events: EventSink,
        options: InstanceOptions,
    ) -> Self {
        Self {
            id: config.qualified_id(),
            config,
            state: parking_lot::Mutex::new(InstanceState {
                status: ServerStatus::Stopped,
                client: None,
                capabilities: None,
                server_info: None,
                last_health_check: None,
                watcher: None,
                generation: 0,
                retired: false,
            }),
            factory,
            events,
            options,
            restart_attempts: AtomicU32::new(0),
            restart_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Registry key: the server id qualified by its configuration file.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn status(&self) -> ServerStatus {
        self.state.lock().status
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.state.lock().capabilities.clone()
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_health_check
    }

    /// Consecutive automatic restarts since the last healthy probe.
    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> ServerSummary {
        let st = self.state.lock();
        ServerSummary {
            server_id: self.id.clone(),
            name: self.config.display_name().to_string(),
            status: st.status,
            last_health_check: st.last_health_check,
            capabilities: st.capabilities.clone(),
            server_info: st.server_info.clone(),
            restart_attempts: self.restart_attempts(),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Connect and run the handshake. Only valid from `Stopped`.
    pub async fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), McpError> {
        let generation = {
            let mut st = self.state.lock();
            if st.retired {
                return Err(McpError::Superseded(self.id.clone()));
            }
            if st.status != ServerStatus::Stopped {
                return Err(McpError::InvalidState {
                    server_id: self.id.clone(),
                    status: st.status,
                    expected: ServerStatus::Stopped,
                });
            }
            st.generation += 1;
            self.set_status(&mut st, ServerStatus::Starting);
            st.generation
        };

        tracing::info!(server_id = %self.id, name = %self.config.display_name(), "starting MCP server");

        let (client, client_events) = match self.connect(cancel).await {
            Ok(connected) => connected,
            Err(e) => {
                let mut st = self.state.lock();
                if st.generation == generation {
                    self.set_status(&mut st, ServerStatus::Error);
                    drop(st);
                    tracing::warn!(server_id = %self.id, error = %e, "failed to start MCP server");
                    self.events.error(&self.id, format!("failed to start: {e}"));
                }
                return Err(e);
            }
        };

        let client = Arc::new(client);
        {
            let mut st = self.state.lock();
            if st.generation == generation && !st.retired {
                st.capabilities = client.capabilities();
                st.server_info = client.server_info();
                st.last_health_check = Some(Utc::now());
                st.watcher = Some(tokio::spawn(watch_client(
                    Arc::downgrade(self),
                    generation,
                    client_events,
                )));
                st.client = Some(client);
                self.set_status(&mut st, ServerStatus::Running);
                tracing::info!(server_id = %self.id, "MCP server running");
                return Ok(());
            }
        }

        tracing::info!(server_id = %self.id, "MCP server stopped while starting, closing new connection");
        let _ = client.close().await;
        Err(McpError::Superseded(self.id.clone()))
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(McpClient, broadcast::Receiver<ClientEvent>), McpError> {
        let transport = self.factory.create(&self.config)?;
        let client = McpClient::new(transport, self.options.client.clone());
        let client_events = client.subscribe();
        match client.connect(cancel).await {
            Ok(_) => Ok((client, client_events)),
            Err(e) => {
                if let Err(close) = client.close().await {
                    tracing::debug!(server_id = %self.id, error = %close, "error releasing failed connection");
                }
                Err(e)
            }
        }
    }

    /// Disconnect and return to `Stopped`. Never fails; a no-op when
    /// already `Stopped` or when another stop is in progress.
    pub async fn stop(&self, cancel: &CancellationToken) {
        let (client, watcher) = {
            let mut st = self.state.lock();
            if matches!(st.status, ServerStatus::Stopped | ServerStatus::Stopping) {
                return;
            }
            st.generation += 1;
            self.set_status(&mut st, ServerStatus::Stopping);
            st.capabilities = None;
            (st.client.take(), st.watcher.take())
        };

        tracing::info!(server_id = %self.id, "stopping MCP server");
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        if let Some(client) = client {
            tokio::select! {
                closed = client.close() => {
                    if let Err(e) = closed {
                        tracing::warn!(server_id = %self.id, error = %e, "error while closing MCP server");
                        self.events.error(&self.id, format!("error while stopping: {e}"));
                    }
                }
                _ = tokio::time::sleep(self.options.stop_timeout) => {
                    tracing::warn!(
                        server_id = %self.id,
                        timeout_secs = self.options.stop_timeout.as_secs_f64(),
                        "MCP server did not close in time, releasing it"
                    );
                }
                _ = cancel.cancelled() => {
                    tracing::debug!(server_id = %self.id, "stop cancelled, releasing connection");
                }
            }
        }

        let mut st = self.state.lock();
        self.set_status(&mut st, ServerStatus::Stopped);
    }

    /// Stop, then start again with the same configuration.
    pub async fn restart(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), McpError> {
        let _gate = self.restart_gate.lock().await;
        self.stop(cancel).await;
        self.start(cancel).await
    }

    /// Restart only if the instance is still in `Error` once any restart
    /// already in progress has finished. Returns whether a restart ran.
    pub(crate) async fn recover(self: &Arc<Self>, cancel: &CancellationToken) -> Result<bool, McpError> {
        let _gate = self.restart_gate.lock().await;
        let status = self.status();
        if status != ServerStatus::Error {
            tracing::debug!(server_id = %self.id, status = %status, "MCP server no longer failed, skipping restart");
            return Ok(false);
        }
        self.stop(cancel).await;
        self.start(cancel).await.map(|()| true)
    }

    /// Mark the instance as leaving the fleet. Pending and future starts
    /// are superseded.
    pub(crate) fn retire(&self) {
        self.state.lock().retired = true;
    }

    // ── Health ────────────────────────────────────────────────────

    /// Probe with `tools/list`. Failure moves the instance to `Error`.
    pub async fn is_healthy(&self, cancel: &CancellationToken) -> bool {
        let (client, generation) = {
            let st = self.state.lock();
            match (&st.client, st.status) {
                (Some(client), ServerStatus::Running) => (client.clone(), st.generation),
                _ => return false,
            }
        };

        let probe = client
            .request_within::<ToolsListResult>(methods::TOOLS_LIST, None, self.options.probe_timeout, cancel)
            .await;

        let mut st = self.state.lock();
        if st.generation != generation {
            return false;
        }
        match probe {
            Ok(_) => {
                st.last_health_check = Some(Utc::now());
                self.restart_attempts.store(0, Ordering::SeqCst);
                true
            }
            Err(e) if e.is_cancelled() => false,
            Err(e) => {
                if st.status == ServerStatus::Running {
                    self.set_status(&mut st, ServerStatus::Error);
                }
                drop(st);
                tracing::warn!(server_id = %self.id, error = %e, "MCP health check failed");
                self.events.error(&self.id, format!("health check failed: {e}"));
                false
            }
        }
    }

    /// Whether the periodic sweep should probe this instance at `now`.
    ///
    /// `slack` absorbs the probe round trip: the last check is stamped when
    /// the probe returns, slightly after the tick that started it.
    pub(crate) fn probe_due(&self, now: DateTime<Utc>, slack: Duration) -> bool {
        let st = self.state.lock();
        if st.status != ServerStatus::Running {
            return false;
        }
        let interval = chrono::Duration::seconds(self.config.health_check_interval_secs.max(1) as i64);
        let slack = chrono::Duration::from_std(slack).unwrap_or_else(|_| chrono::Duration::zero());
        match st.last_health_check {
            Some(last) => now - last + slack >= interval,
            None => true,
        }
    }

    pub(crate) fn next_restart_attempt(&self) -> u32 {
        self.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ── Forwarding ────────────────────────────────────────────────

    fn running_client(&self) -> Result<Arc<McpClient>, McpError> {
        let st = self.state.lock();
        match (&st.client, st.status) {
            (Some(client), ServerStatus::Running) => Ok(client.clone()),
            (_, status) => Err(McpError::InvalidState {
                server_id: self.id.clone(),
                status,
                expected: ServerStatus::Running,
            }),
        }
    }

    pub async fn get_tools(&self, cancel: &CancellationToken) -> Result<Vec<McpToolDef>, McpError> {
        self.running_client()?.list_tools(cancel).await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResult, McpError> {
        let client = self.running_client()?;
        tracing::debug!(server_id = %self.id, tool = %name, "calling MCP tool");
        client.call_tool(name, arguments, cancel).await
    }

    pub async fn get_resources(&self, cancel: &CancellationToken) -> Result<Vec<McpResource>, McpError> {
        self.running_client()?.list_resources(cancel).await
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<ReadResourceResult, McpError> {
        self.running_client()?.read_resource(uri, cancel).await
    }

    // ── Internals ─────────────────────────────────────────────────

    fn set_status(&self, st: &mut InstanceState, new: ServerStatus) {
        let old = st.status;
        st.status = new;
        if old != new {
            tracing::debug!(server_id = %self.id, from = %old, to = %new, "MCP server status changed");
        }
        self.events.status_changed(&self.id, old, new);
    }

    /// Called by the watcher when the connection dies under a running instance.
    fn connection_failed(&self, generation: u64, message: &str) {
        let mut st = self.state.lock();
        if st.generation != generation || st.status != ServerStatus::Running {
            return;
        }
        self.set_status(&mut st, ServerStatus::Error);
        drop(st);
        tracing::warn!(server_id = %self.id, error = %message, "MCP server connection lost");
        self.events.error(&self.id, message);
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(watcher) = self.state.get_mut().watcher.take() {
            watcher.abort();
        }
    }
}

/// Forward client events for one connection generation.
async fn watch_client(
    instance: Weak<ServerInstance>,
    generation: u64,
    mut events: broadcast::Receiver<ClientEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "MCP client events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(instance) = instance.upgrade() else {
            return;
        };
        match event {
            ClientEvent::Notification(notification) => {
                instance.events.emit(FleetEvent::Notification {
                    server_id: instance.id.clone(),
                    notification,
                });
            }
            ClientEvent::TransportError { message, fatal: true } => {
                instance.connection_failed(generation, &message);
                return;
            }
            ClientEvent::TransportError { message, fatal: false } => {
                tracing::debug!(server_id = %instance.id, error = %message, "MCP transport fault");
            }
            ClientEvent::CapabilitiesReceived(_) => {}
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;

    use super::*;
    use crate::protocol::{JsonRpcError, ToolCallContent};
    use crate::server::{rpc_error, InProcessTransportFactory, McpServerHandler};

    #[derive(Default)]
    struct Flaky {
        broken: AtomicBool,
        slow_start: AtomicBool,
    }

    #[async_trait]
    impl McpServerHandler for Flaky {
        fn server_info(&self) -> Implementation {
            Implementation {
                name: "flaky".into(),
                version: "0.0.1".into(),
            }
        }

        fn capabilities(&self) -> ServerCapabilities {
            ServerCapabilities::default()
        }

        async fn list_tools(&self) -> Result<Vec<McpToolDef>, JsonRpcError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(rpc_error(-32000, "tool registry unavailable"));
            }
            Ok(vec![McpToolDef {
                name: "probe".into(),
                description: String::new(),
                input_schema: serde_json::json!({ "type": "object" }),
            }])
        }

        async fn call_tool(&self, name: &str, _arguments: Value) -> Result<ToolCallResult, JsonRpcError> {
            Ok(ToolCallResult {
                content: vec![ToolCallContent::text(name)],
                is_error: false,
            })
        }
    }

    /// Delays `initialize` when asked, so a stop can land mid-start.
    struct SlowFactory {
        inner: InProcessTransportFactory,
        handler: Arc<Flaky>,
    }

    impl TransportFactory for SlowFactory {
        fn create(&self, config: &ServerConfig) -> Result<Box<dyn crate::transport::Transport>, McpError> {
            if self.handler.slow_start.load(Ordering::SeqCst) {
                let (transport, end) = crate::transport::InProcessTransport::pair();
                let handler = self.handler.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    crate::server::serve_in_process(end, handler);
                });
                return Ok(Box::new(transport));
            }
            self.inner.create(config)
        }
    }

    fn instance_with(handler: Arc<Flaky>) -> (Arc<ServerInstance>, EventSink) {
        let factory = InProcessTransportFactory::new();
        factory.register("demo", handler.clone());
        let sink = EventSink::new(64);
        let instance = ServerInstance::new(
            ServerConfig::new("demo").with_command("demo-server", Vec::<String>::new()),
            Arc::new(SlowFactory {
                inner: factory,
                handler,
            }),
            sink.clone(),
            InstanceOptions::default(),
        );
        (Arc::new(instance), sink)
    }

    #[tokio::test]
    async fn start_and_stop_walk_the_state_machine() {
        let (instance, sink) = instance_with(Arc::new(Flaky::default()));
        let mut events = sink.subscribe();
        let cancel = CancellationToken::new();

        assert_eq!(instance.status(), ServerStatus::Stopped);
        instance.start(&cancel).await.unwrap();
        assert_eq!(instance.status(), ServerStatus::Running);
        assert!(instance.last_health_check().is_some());
        assert!(instance.capabilities().is_some());

        let tools = instance.get_tools(&cancel).await.unwrap();
        assert_eq!(tools[0].name, "probe");

        instance.stop(&cancel).await;
        assert_eq!(instance.status(), ServerStatus::Stopped);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FleetEvent::StatusChanged { new, .. } = event {
                seen.push(new);
            }
        }
        assert_eq!(
            seen,
            vec![
                ServerStatus::Starting,
                ServerStatus::Running,
                ServerStatus::Stopping,
                ServerStatus::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn stop_on_stopped_is_a_noop() {
        let (instance, sink) = instance_with(Arc::new(Flaky::default()));
        let mut events = sink.subscribe();
        instance.stop(&CancellationToken::new()).await;
        assert_eq!(instance.status(), ServerStatus::Stopped);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_is_rejected_unless_stopped() {
        let (instance, _) = instance_with(Arc::new(Flaky::default()));
        let cancel = CancellationToken::new();
        instance.start(&cancel).await.unwrap();
        let err = instance.start(&cancel).await.unwrap_err();
        assert!(matches!(
            err,
            McpError::InvalidState {
                status: ServerStatus::Running,
                ..
            }
        ));
        instance.stop(&cancel).await;
    }

    #[tokio::test]
    async fn forwarding_requires_running() {
        let (instance, _) = instance_with(Arc::new(Flaky::default()));
        let err = instance
            .call_tool("probe", serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            McpError::InvalidState {
                status: ServerStatus::Stopped,
                expected: ServerStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failed_start_moves_to_error() {
        let sink = EventSink::new(16);
        let instance = Arc::new(ServerInstance::new(
            ServerConfig::new("ghost").with_command("ghost", Vec::<String>::new()),
            Arc::new(InProcessTransportFactory::new()),
            sink.clone(),
            InstanceOptions::default(),
        ));
        let err = instance.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, McpError::Config(_)));
        assert_eq!(instance.status(), ServerStatus::Error);

        // Error -> Stopped via stop, after which start is allowed again.
        instance.stop(&CancellationToken::new()).await;
        assert_eq!(instance.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn failed_probe_moves_to_error_and_success_resets_attempts() {
        let handler = Arc::new(Flaky::default());
        let (instance, _) = instance_with(handler.clone());
        let cancel = CancellationToken::new();
        instance.start(&cancel).await.unwrap();

        assert_eq!(instance.next_restart_attempt(), 1);
        assert!(instance.is_healthy(&cancel).await);
        assert_eq!(instance.restart_attempts(), 0);

        handler.broken.store(true, Ordering::SeqCst);
        assert!(!instance.is_healthy(&cancel).await);
        assert_eq!(instance.status(), ServerStatus::Error);
        assert!(!instance.is_healthy(&cancel).await);
        instance.stop(&cancel).await;
    }

    #[tokio::test]
    async fn probe_due_allows_for_the_probe_round_trip() {
        let (instance, _) = instance_with(Arc::new(Flaky::default()));
        let cancel = CancellationToken::new();
        assert!(!instance.probe_due(Utc::now(), Duration::ZERO));

        instance.start(&cancel).await.unwrap();
        let last = instance.last_health_check().unwrap();
        let just_short = last + chrono::Duration::milliseconds(29_900);
        assert!(!instance.probe_due(just_short, Duration::ZERO));
        assert!(instance.probe_due(just_short, Duration::from_secs(1)));
        assert!(instance.probe_due(last + chrono::Duration::seconds(30), Duration::ZERO));
        assert!(!instance.probe_due(last + chrono::Duration::seconds(15), Duration::from_secs(1)));
        instance.stop(&cancel).await;
    }

    #[tokio::test]
    async fn recover_only_restarts_a_failed_instance() {
        let handler = Arc::new(Flaky::default());
        let (instance, sink) = instance_with(handler.clone());
        let cancel = CancellationToken::new();
        instance.start(&cancel).await.unwrap();

        let mut events = sink.subscribe();
        assert!(!instance.recover(&cancel).await.unwrap());
        assert_eq!(instance.status(), ServerStatus::Running);
        assert!(events.try_recv().is_err());

        handler.broken.store(true, Ordering::SeqCst);
        assert!(!instance.is_healthy(&cancel).await);
        handler.broken.store(false, Ordering::SeqCst);
        assert!(instance.recover(&cancel).await.unwrap());
        assert_eq!(instance.status(), ServerStatus::Running);
        instance.stop(&cancel).await;
    }

    #[tokio::test]
    async fn concurrent_restarts_do_not_interleave() {
        let (instance, _) = instance_with(Arc::new(Flaky::default()));
        let cancel = CancellationToken::new();
        instance.start(&cancel).await.unwrap();

        let (one, two) = tokio::join!(instance.restart(&cancel), instance.restart(&cancel));
        assert!(one.is_ok());
        assert!(two.is_ok());
        assert_eq!(instance.status(), ServerStatus::Running);
        instance.stop(&cancel).await;
    }

    #[tokio::test]
    async fn stop_during_start_supersedes_it() {
        let handler = Arc::new(Flaky::default());
        handler.slow_start.store(true, Ordering::SeqCst);
        let (instance, _) = instance_with(handler);
        let cancel = CancellationToken::new();

        let starting = {
            let instance = instance.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { instance.start(&cancel).await })
        };
        while instance.status() != ServerStatus::Starting {
            tokio::task::yield_now().await;
        }
        instance.retire();
        instance.stop(&cancel).await;

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(McpError::Superseded(_))));
        assert_eq!(instance.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn lost_connection_moves_running_instance_to_error() {
        let (transport, end) = crate::transport::InProcessTransport::pair();
        struct OneShot(parking_lot::Mutex<Option<Box<dyn crate::transport::Transport>>>);
        impl TransportFactory for OneShot {
            fn create(&self, _: &ServerConfig) -> Result<Box<dyn crate::transport::Transport>, McpError> {
                self.0.lock().take().ok_or(McpError::Closed)
            }
        }
        let server = crate::server::serve_in_process(end, Arc::new(Flaky::default()));

        let sink = EventSink::new(16);
        let instance = Arc::new(ServerInstance::new(
            ServerConfig::new("demo").with_command("demo", Vec::<String>::new()),
            Arc::new(OneShot(parking_lot::Mutex::new(Some(Box::new(transport))))),
            sink.clone(),
            InstanceOptions::default(),
        ));
        let mut events = sink.subscribe();
        instance.start(&CancellationToken::new()).await.unwrap();

        server.abort();
        loop {
            match events.recv().await.unwrap() {
                FleetEvent::Error { message, .. } => {
                    assert!(message.contains("connection closed"));
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(instance.status(), ServerStatus::Error);
    }
}
