//! Fleet manager: the registry of server instances and the policy around
//! them (health sweeps, automatic restarts, discovery, teardown).
//!
//! Background work never returns errors to anyone. Sweep and restart
//! failures become `tracing` records plus [`FleetEvent`]s, so one broken
//! server cannot stop monitoring of the rest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use mf_domain::config::ServerConfig;
use mf_domain::error::ConfigError;

use crate::backoff::RestartBackoff;
use crate::client::ClientOptions;
use crate::error::McpError;
use crate::events::{EventSink, FleetEvent, ServerStatus};
use crate::instance::{InstanceOptions, ServerInstance, ServerSummary};
use crate::loader;
use crate::protocol::{Implementation, McpResource, McpToolDef, ToolCallResult};
use crate::transport::{DefaultTransportFactory, TransportFactory};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fleet-wide tuning.
#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// Period of the health sweep ticker.
    pub health_check_interval: Duration,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    /// Per-server wait for the transport to close.
    pub stop_timeout: Duration,
    /// Bound on the whole of [`FleetManager::shutdown`].
    pub shutdown_timeout: Duration,
    pub restart_backoff: RestartBackoff,
    pub event_capacity: usize,
    pub discovery_depth: usize,
    pub client_info: Implementation,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            restart_backoff: RestartBackoff::default(),
            event_capacity: 256,
            discovery_depth: loader::DEFAULT_SEARCH_DEPTH,
            client_info: Implementation::default(),
        }
    }
}

/// Tools advertised by one running server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerTools {
    pub server_id: String,
    pub server_name: String,
    pub tools: Vec<McpToolDef>,
}

/// A resource tagged with the server that offers it.
#[derive(Debug, Clone, Serialize)]
pub struct ServerResource {
    pub server_id: String,
    pub server_name: String,
    pub resource: McpResource,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FleetManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Inner {
    servers: parking_lot::RwLock<HashMap<String, Arc<ServerInstance>>>,
    factory: Arc<dyn TransportFactory>,
    events: EventSink,
    options: FleetOptions,
    restarts: TaskTracker,
    shutdown: CancellationToken,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

/// Owns every managed MCP server. Cheap to clone.
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<Inner>,
}

impl FleetManager {
    /// Manager using the stdio/SSE transports.
    pub fn new(options: FleetOptions) -> Self {
        Self::with_factory(Arc::new(DefaultTransportFactory::default()), options)
    }

    pub fn with_factory(factory: Arc<dyn TransportFactory>, options: FleetOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                servers: parking_lot::RwLock::new(HashMap::new()),
                factory,
                events: EventSink::new(options.event_capacity),
                options,
                restarts: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                monitor: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    pub fn options(&self) -> &FleetOptions {
        &self.inner.options
    }

    fn instance_options(&self) -> InstanceOptions {
        let o = &self.inner.options;
        InstanceOptions {
            client: ClientOptions {
                client_info: o.client_info.clone(),
                request_timeout: o.request_timeout,
                ..ClientOptions::default()
            },
            probe_timeout: o.probe_timeout,
            stop_timeout: o.stop_timeout,
        }
    }

    // ── Start / stop / restart ────────────────────────────────────

    /// Register and start a server. A duplicate id is rejected without
    /// touching the registered instance; a failed start leaves nothing
    /// registered.
    pub async fn start_server(
        &self,
        config: ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<ServerInstance>, McpError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(McpError::Closed);
        }
        config.validate()?;

        let instance = Arc::new(ServerInstance::new(
            config,
            self.inner.factory.clone(),
            self.inner.events.clone(),
            self.instance_options(),
        ));
        let id = instance.id().to_string();
        {
            let mut servers = self.inner.servers.write();
            if servers.contains_key(&id) {
                return Err(McpError::AlreadyRegistered(id));
            }
            servers.insert(id.clone(), instance.clone());
        }

        match instance.start(cancel).await {
            Ok(()) => {
                self.ensure_health_monitor();
                Ok(instance)
            }
            Err(e) => {
                self.remove_if_same(&id, &instance);
                instance.stop(&CancellationToken::new()).await;
                Err(e)
            }
        }
    }

    /// Stop and unregister a server. Returns false for unknown ids.
    pub async fn stop_server(&self, server_id: &str, cancel: &CancellationToken) -> bool {
        let Some(instance) = self.get_server(server_id) else {
            return false;
        };
        instance.retire();
        instance.stop(cancel).await;
        self.remove_if_same(server_id, &instance);
        true
    }

    /// Stop and start a registered server in place, keeping its identity.
    /// A failed restart leaves it registered in `Error`.
    pub async fn restart_server(&self, server_id: &str, cancel: &CancellationToken) -> Result<(), McpError> {
        let instance = self
            .get_server(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        instance.restart(cancel).await
    }

    /// Start every enabled, auto-start config concurrently. Failures are
    /// logged and counted out; returns how many started.
    pub async fn start_auto_start_servers(&self, configs: &[ServerConfig]) -> usize {
        let cancel = self.inner.shutdown.child_token();
        let starts = configs
            .iter()
            .filter(|c| !c.disabled && c.auto_start)
            .map(|config| {
                let cancel = &cancel;
                async move {
                    match self.start_server(config.clone(), cancel).await {
                        Ok(_) => true,
                        Err(e) => {
                            tracing::warn!(server_id = %config.server_id, error = %e, "auto-start failed");
                            false
                        }
                    }
                }
            });
        let started = join_all(starts).await.into_iter().filter(|ok| *ok).count();
        tracing::info!(started, "MCP auto-start finished");
        started
    }

    fn remove_if_same(&self, server_id: &str, instance: &Arc<ServerInstance>) {
        let mut servers = self.inner.servers.write();
        if servers.get(server_id).is_some_and(|current| Arc::ptr_eq(current, instance)) {
            servers.remove(server_id);
        }
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn get_server(&self, server_id: &str) -> Option<Arc<ServerInstance>> {
        self.inner.servers.read().get(server_id).cloned()
    }

    /// `NotFound` for ids that are not registered.
    pub fn get_server_status(&self, server_id: &str) -> ServerStatus {
        self.get_server(server_id)
            .map(|i| i.status())
            .unwrap_or(ServerStatus::NotFound)
    }

    pub fn list_servers(&self) -> Vec<ServerSummary> {
        let mut summaries: Vec<_> = self.inner.servers.read().values().map(|i| i.summary()).collect();
        summaries.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        summaries
    }

    pub fn get_running_servers(&self) -> Vec<Arc<ServerInstance>> {
        let mut running: Vec<_> = self
            .inner
            .servers
            .read()
            .values()
            .filter(|i| i.status() == ServerStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.id().cmp(b.id()));
        running
    }

    pub fn server_count(&self) -> usize {
        self.inner.servers.read().len()
    }

    pub async fn is_server_healthy(&self, server_id: &str, cancel: &CancellationToken) -> bool {
        match self.get_server(server_id) {
            Some(instance) => instance.is_healthy(cancel).await,
            None => false,
        }
    }

    /// Tool lists of every running server, fetched concurrently. Servers
    /// that fail to answer are logged and left out.
    pub async fn get_all_tools(&self, cancel: &CancellationToken) -> Vec<ServerTools> {
        let running = self.get_running_servers();
        let lists = join_all(running.iter().map(|i| i.get_tools(cancel))).await;
        running
            .iter()
            .zip(lists)
            .filter_map(|(instance, tools)| match tools {
                Ok(tools) => Some(ServerTools {
                    server_id: instance.id().to_string(),
                    server_name: instance.config().display_name().to_string(),
                    tools,
                }),
                Err(e) => {
                    tracing::warn!(server_id = %instance.id(), error = %e, "failed to list MCP tools");
                    None
                }
            })
            .collect()
    }

    /// Resources of every running server, each tagged with its origin.
    pub async fn get_all_resources(&self, cancel: &CancellationToken) -> Vec<ServerResource> {
        let running = self.get_running_servers();
        let lists = join_all(running.iter().map(|i| i.get_resources(cancel))).await;
        let mut out = Vec::new();
        for (instance, resources) in running.iter().zip(lists) {
            match resources {
                Ok(resources) => out.extend(resources.into_iter().map(|resource| ServerResource {
                    server_id: instance.id().to_string(),
                    server_name: instance.config().display_name().to_string(),
                    resource,
                })),
                Err(e) => {
                    tracing::warn!(server_id = %instance.id(), error = %e, "failed to list MCP resources");
                }
            }
        }
        out
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResult, McpError> {
        let instance = self
            .get_server(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        instance.call_tool(tool_name, arguments, cancel).await
    }

    // ── Health ────────────────────────────────────────────────────

    /// Probe every running server now. Returns how many failed.
    pub async fn check_health(&self) -> usize {
        self.sweep(false).await
    }

    /// Start the periodic sweep if it is not running yet.
    pub fn start_health_monitor(&self) {
        self.ensure_health_monitor();
    }

    fn ensure_health_monitor(&self) {
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.options.health_check_interval;

        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // Awaited in the loop, so sweeps never overlap.
                FleetManager { inner }.sweep(true).await;
            }
            tracing::debug!("MCP health monitor stopped");
        }));
        tracing::debug!(period_secs = period.as_secs(), "MCP health monitor started");
    }

    async fn sweep(&self, only_due: bool) -> usize {
        let now = Utc::now();
        let slack = self.inner.options.health_check_interval / 2;
        let targets: Vec<Arc<ServerInstance>> = self
            .inner
            .servers
            .read()
            .values()
            .filter(|i| i.status() == ServerStatus::Running && (!only_due || i.probe_due(now, slack)))
            .cloned()
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let cancel = &self.inner.shutdown;
        let results = join_all(targets.iter().map(|i| i.is_healthy(cancel))).await;

        let mut unhealthy = 0;
        for (instance, healthy) in targets.into_iter().zip(results) {
            if healthy || cancel.is_cancelled() {
                continue;
            }
            // Probes also come back false when a concurrent stop or restart
            // replaced the connection; only act on a real failure.
            if instance.status() == ServerStatus::Error {
                unhealthy += 1;
                self.handle_unhealthy(instance);
            }
        }
        tracing::debug!(unhealthy, "MCP health sweep finished");
        unhealthy
    }

    /// Apply the restart policy to an instance that just failed.
    fn handle_unhealthy(&self, instance: Arc<ServerInstance>) {
        let config = instance.config();
        let server_id = instance.id().to_string();
        if !config.auto_restart {
            tracing::info!(server_id = %server_id, "auto-restart disabled, leaving MCP server in error");
            return;
        }
        let attempts = instance.restart_attempts();
        if attempts >= config.max_restart_attempts {
            tracing::warn!(server_id = %server_id, attempts, "MCP server restart attempts exhausted");
            self.inner.events.emit(FleetEvent::RestartExhausted { server_id, attempts });
            return;
        }

        let attempt = instance.next_restart_attempt();
        let delay = self.inner.options.restart_backoff.delay_for(&server_id, attempt);
        tracing::info!(
            server_id = %server_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling MCP server restart"
        );
        self.inner.events.emit(FleetEvent::RestartScheduled {
            server_id: server_id.clone(),
            attempt,
        });

        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        self.inner.restarts.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let still_registered = inner
                .servers
                .read()
                .get(&server_id)
                .is_some_and(|current| Arc::ptr_eq(current, &instance));
            if !still_registered {
                return;
            }

            match instance.recover(&shutdown).await {
                Ok(true) => tracing::info!(server_id = %server_id, attempt, "MCP server restarted"),
                Ok(false) => {}
                Err(McpError::Superseded(_)) => {
                    tracing::debug!(server_id = %server_id, "restart superseded by a stop");
                }
                Err(e) if shutdown.is_cancelled() => {
                    tracing::debug!(server_id = %server_id, error = %e, "restart abandoned at shutdown");
                }
                // Another transition owns the instance now; its outcome stands.
                Err(e) if instance.status() != ServerStatus::Error => {
                    tracing::debug!(server_id = %server_id, error = %e, "restart overtaken by another transition");
                }
                Err(e) => {
                    tracing::warn!(server_id = %server_id, attempt, error = %e, "automatic restart failed");
                    inner.events.error(&server_id, format!("automatic restart failed: {e}"));
                    FleetManager { inner }.handle_unhealthy(instance);
                }
            }
        });
    }

    // ── Configuration ─────────────────────────────────────────────

    /// Find `mcp.json` files under `base` (default: the current directory)
    /// and the standard locations. Returns the enabled servers found.
    pub async fn discover_servers(&self, base: Option<&Path>) -> Vec<ServerConfig> {
        let base = base
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
        let depth = self.inner.options.discovery_depth;

        let search_base = base.clone();
        let discovery = match tokio::task::spawn_blocking(move || loader::discover(&search_base, depth)).await {
            Ok(discovery) => discovery,
            Err(e) => {
                tracing::warn!(base = %base.display(), error = %e, "MCP discovery task failed");
                self.inner.events.emit(FleetEvent::DiscoveryFailed {
                    path: base,
                    message: e.to_string(),
                });
                return Vec::new();
            }
        };

        for (path, error) in &discovery.failures {
            self.inner.events.emit(FleetEvent::DiscoveryFailed {
                path: path.clone(),
                message: error.to_string(),
            });
        }
        let servers = discovery.servers();
        self.inner.events.emit(FleetEvent::ServersDiscovered {
            files: discovery.configurations.len(),
            server_ids: servers.iter().map(ServerConfig::qualified_id).collect(),
        });
        servers
    }

    /// Load one file and return its enabled servers.
    pub async fn load_configuration_file(&self, path: &Path) -> Result<Vec<ServerConfig>, McpError> {
        let owned = path.to_path_buf();
        let loaded = blocking(path, move || loader::load(&owned)).await?;
        Ok(loaded.enabled_servers().cloned().collect())
    }

    /// Save configs back to their source files; configs without one go to
    /// `path`. Returns the files written.
    pub async fn save_configuration_file(
        &self,
        configs: &[ServerConfig],
        path: &Path,
    ) -> Result<Vec<PathBuf>, McpError> {
        let configs = configs.to_vec();
        let owned = path.to_path_buf();
        Ok(blocking(path, move || loader::save_servers(&configs, &owned)).await?)
    }

    pub async fn create_default_configuration(&self, path: &Path) -> Result<bool, McpError> {
        let owned = path.to_path_buf();
        Ok(blocking(path, move || loader::create_default_configuration(&owned)).await?)
    }

    // ── Teardown ──────────────────────────────────────────────────

    /// Stop every server and the health monitor, bounded by
    /// `shutdown_timeout`. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }
        self.inner.restarts.close();

        let instances: Vec<Arc<ServerInstance>> = self.inner.servers.write().drain().map(|(_, i)| i).collect();
        if !instances.is_empty() {
            tracing::info!(count = instances.len(), "stopping MCP servers");
        }
        for instance in &instances {
            instance.retire();
        }

        let cancel = CancellationToken::new();
        let teardown = async {
            self.inner.restarts.wait().await;
            join_all(instances.iter().map(|i| i.stop(&cancel))).await;
        };
        if tokio::time::timeout(self.inner.options.shutdown_timeout, teardown)
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = self.inner.options.shutdown_timeout.as_secs_f64(),
                "MCP teardown timed out, releasing remaining servers"
            );
        }
    }
}

/// Run blocking file work off the async threads.
async fn blocking<T, F>(path: &Path, work: F) -> Result<T, ConfigError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ConfigError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        })?
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::protocol::{JsonRpcError, ServerCapabilities, ToolCallContent};
    use crate::server::{InProcessTransportFactory, McpServerHandler};

    struct Static;

    #[async_trait]
    impl McpServerHandler for Static {
        fn server_info(&self) -> Implementation {
            Implementation {
                name: "static".into(),
                version: "1".into(),
            }
        }

        fn capabilities(&self) -> ServerCapabilities {
            ServerCapabilities::default()
        }

        async fn list_tools(&self) -> Result<Vec<McpToolDef>, JsonRpcError> {
            Ok(vec![McpToolDef {
                name: "noop".into(),
                description: "Does nothing".into(),
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

    fn fleet() -> FleetManager {
        let factory = InProcessTransportFactory::new();
        factory.register("a", Arc::new(Static));
        factory.register("b", Arc::new(Static));
        FleetManager::with_factory(Arc::new(factory), FleetOptions::default())
    }

    fn config(id: &str) -> ServerConfig {
        ServerConfig::new(id).with_command("static", Vec::<String>::new())
    }

    #[tokio::test]
    async fn unknown_ids() {
        let fleet = fleet();
        let cancel = CancellationToken::new();
        assert_eq!(fleet.get_server_status("nope"), ServerStatus::NotFound);
        assert!(!fleet.stop_server("nope", &cancel).await);
        assert!(matches!(
            fleet.restart_server("nope", &cancel).await,
            Err(McpError::ServerNotFound(_))
        ));
        assert!(matches!(
            fleet.call_tool("nope", "noop", Value::Null, &cancel).await,
            Err(McpError::ServerNotFound(_))
        ));
        assert!(!fleet.is_server_healthy("nope", &cancel).await);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_registration() {
        let fleet = fleet();
        let err = fleet
            .start_server(ServerConfig::new("empty"), &CancellationToken::new())
            .await
            .err()
            .expect("expected an error");
        assert!(matches!(err, McpError::Config(_)));
        assert_eq!(fleet.server_count(), 0);
    }

    #[tokio::test]
    async fn auto_start_counts_successes_only() {
        let fleet = fleet();
        let mut a = config("a");
        a.auto_start = true;
        let mut b = config("b");
        b.auto_start = true;
        b.disabled = true;
        let mut ghost = config("ghost");
        ghost.auto_start = true;
        let manual = config("manual");

        let started = fleet.start_auto_start_servers(&[a, b, ghost, manual]).await;
        assert_eq!(started, 1);
        assert_eq!(fleet.server_count(), 1);
        assert_eq!(fleet.get_server_status("a"), ServerStatus::Running);
        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn aggregated_tools_are_tagged_by_server() {
        let fleet = fleet();
        let cancel = CancellationToken::new();
        fleet.start_server(config("a"), &cancel).await.unwrap();
        fleet.start_server(config("b"), &cancel).await.unwrap();

        let all = fleet.get_all_tools(&cancel).await;
        let ids: Vec<_> = all.iter().map(|t| t.server_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(all.iter().all(|t| t.tools[0].name == "noop"));

        let summaries = fleet.list_servers();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].status, ServerStatus::Running);
        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_the_fleet() {
        let fleet = fleet();
        let cancel = CancellationToken::new();
        fleet.start_server(config("a"), &cancel).await.unwrap();
        fleet.shutdown().await;
        fleet.shutdown().await;
        assert_eq!(fleet.server_count(), 0);
        assert!(matches!(
            fleet.start_server(config("b"), &cancel).await,
            Err(McpError::Closed)
        ));
    }
}
