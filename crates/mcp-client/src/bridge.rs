//! Tool/risk bridge: exposes the tools of running MCP servers to a language
//! model and gates their execution behind risk policy and approval.
//!
//! Model-facing function names are `mcp_{server}_{tool}` and are resolved
//! through an explicit registry rebuilt on every [`McpToolBridge::refresh`],
//! never by parsing the name back apart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use mf_domain::policy::{ApprovalProcess, RiskLevel};
use mf_domain::tool::ToolDefinition;

use crate::events::ServerStatus;
use crate::manager::{FleetManager, ServerResource};
use crate::protocol::{McpToolDef, ToolCallResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The verdict of a reviewer, human or assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: Option<String> },
}

/// A tool call waiting for a verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRequest {
    pub server_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Value,
    pub risk_level: RiskLevel,
}

/// Yields the highest risk level allowed in the current context.
pub trait RiskPolicy: Send + Sync {
    fn max_risk_level(&self) -> RiskLevel;
}

/// A fixed ceiling.
impl RiskPolicy for RiskLevel {
    fn max_risk_level(&self) -> RiskLevel {
        *self
    }
}

/// Asks a reviewer whether a tool call may run.
#[async_trait]
pub trait ApprovalProvider: Send + Sync {
    async fn ask_user(&self, request: &ToolCallRequest) -> ApprovalDecision;

    async fn ask_assistant(&self, request: &ToolCallRequest) -> ApprovalDecision;
}

/// Receives the converted tool definitions for presentation to a model.
pub trait ToolSchemaSink: Send + Sync {
    fn publish(&self, tools: &[ToolDefinition]);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry entry behind one model-facing function name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgedTool {
    pub function_name: String,
    /// Registry key of the owning server in the fleet.
    pub server_id: String,
    pub server_name: String,
    pub tool_name: String,
    /// Inherent risk capped at the server's maximum.
    pub risk_level: RiskLevel,
}

/// Text handed back to the model, flagged when it describes a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

pub struct McpToolBridge {
    fleet: FleetManager,
    risk_policy: Arc<dyn RiskPolicy>,
    approvals: Arc<dyn ApprovalProvider>,
    registry: RwLock<HashMap<String, BridgedTool>>,
}

impl McpToolBridge {
    pub fn new(
        fleet: FleetManager,
        risk_policy: Arc<dyn RiskPolicy>,
        approvals: Arc<dyn ApprovalProvider>,
    ) -> Self {
        Self {
            fleet,
            risk_policy,
            approvals,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the registry from the running servers and return the
    /// model-facing definitions, ordered by server then tool.
    ///
    /// Servers whose maximum risk exceeds the policy ceiling are left out
    /// entirely, as are servers that fail to list their tools.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Vec<ToolDefinition> {
        let ceiling = self.risk_policy.max_risk_level();
        let servers: Vec<_> = self
            .fleet
            .get_running_servers()
            .into_iter()
            .filter(|s| !s.config().disabled && s.config().max_risk_level <= ceiling)
            .collect();
        let listings = join_all(servers.iter().map(|s| s.get_tools(cancel))).await;

        let mut registry = HashMap::new();
        let mut definitions = Vec::new();
        for (server, tools) in servers.iter().zip(listings) {
            let tools = match tools {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(server_id = %server.id(), error = %e, "skipping MCP server tools");
                    continue;
                }
            };
            let config = server.config();
            for tool in tools {
                let function_name = unique_name(
                    &registry,
                    format!("mcp_{}_{}", sanitize(&config.server_id), sanitize(&tool.name)),
                );
                let risk_level = analyze_risk(&tool).min(config.max_risk_level);
                definitions.push(ToolDefinition {
                    name: function_name.clone(),
                    description: describe(config.display_name(), &tool),
                    parameters: parameter_schema(&tool.input_schema),
                });
                registry.insert(
                    function_name.clone(),
                    BridgedTool {
                        function_name,
                        server_id: server.id().to_string(),
                        server_name: config.display_name().to_string(),
                        tool_name: tool.name,
                        risk_level,
                    },
                );
            }
        }

        tracing::debug!(tools = definitions.len(), "MCP tool registry rebuilt");
        *self.registry.write() = registry;
        definitions
    }

    /// Refresh and hand the definitions to `sink`. Returns how many.
    pub async fn publish(&self, sink: &dyn ToolSchemaSink, cancel: &CancellationToken) -> usize {
        let definitions = self.refresh(cancel).await;
        sink.publish(&definitions);
        definitions.len()
    }

    pub fn lookup(&self, function_name: &str) -> Option<BridgedTool> {
        self.registry.read().get(function_name).cloned()
    }

    pub fn tools(&self) -> Vec<BridgedTool> {
        let mut tools: Vec<_> = self.registry.read().values().cloned().collect();
        tools.sort_by(|a, b| a.function_name.cmp(&b.function_name));
        tools
    }

    /// Run a model-requested call through policy and approval, then on the
    /// server. Every outcome, including refusals, comes back as text.
    pub async fn call(&self, function_name: &str, arguments: Value, cancel: &CancellationToken) -> ToolOutput {
        let Some(tool) = self.lookup(function_name) else {
            return ToolOutput::error(format!("unknown MCP tool: '{function_name}'"));
        };
        let server = match self.fleet.get_server(&tool.server_id) {
            Some(server) if server.status() == ServerStatus::Running => server,
            _ => return ToolOutput::error(format!("MCP server '{}' is not available", tool.server_name)),
        };

        let config = server.config();
        if config.max_risk_level > self.risk_policy.max_risk_level() {
            tracing::warn!(function = %function_name, "MCP tool blocked by risk policy");
            return ToolOutput::error(format!(
                "MCP server '{}' exceeds the allowed risk level",
                tool.server_name
            ));
        }

        let request = ToolCallRequest {
            server_id: tool.server_id.clone(),
            server_name: tool.server_name.clone(),
            tool_name: tool.tool_name.clone(),
            arguments,
            risk_level: tool.risk_level,
        };
        if let Err(denial) = self.approve(config.approval_process, &request).await {
            tracing::info!(function = %function_name, "MCP tool call denied");
            return ToolOutput::error(denial);
        }

        match server.call_tool(&tool.tool_name, request.arguments, cancel).await {
            Ok(result) => convert_result(&result),
            Err(e) => ToolOutput::error(format!("MCP tool execution failed: {e}")),
        }
    }

    /// Resources of every running server allowed by the risk policy.
    pub async fn resources(&self, cancel: &CancellationToken) -> Vec<ServerResource> {
        let ceiling = self.risk_policy.max_risk_level();
        self.fleet
            .get_all_resources(cancel)
            .await
            .into_iter()
            .filter(|r| {
                self.fleet
                    .get_server(&r.server_id)
                    .is_some_and(|s| s.config().max_risk_level <= ceiling)
            })
            .collect()
    }

    /// `Err` carries the denial message for the model.
    async fn approve(&self, process: ApprovalProcess, request: &ToolCallRequest) -> Result<(), String> {
        let (reviewer, decision) = match process {
            ApprovalProcess::AllowAll => return Ok(()),
            ApprovalProcess::DenyAll => ("policy", ApprovalDecision::Denied { reason: None }),
            ApprovalProcess::User => ("user", self.approvals.ask_user(request).await),
            ApprovalProcess::Assistant => ("assistant", self.approvals.ask_assistant(request).await),
            ApprovalProcess::UserWhenAssistantDenies => match self.approvals.ask_assistant(request).await {
                ApprovalDecision::Approved => return Ok(()),
                ApprovalDecision::Denied { .. } => ("user", self.approvals.ask_user(request).await),
            },
        };
        match decision {
            ApprovalDecision::Approved => Ok(()),
            ApprovalDecision::Denied { reason: Some(reason) } if !reason.trim().is_empty() => Err(format!(
                "tool call '{}' denied by {reviewer}: {reason}",
                request.tool_name
            )),
            ApprovalDecision::Denied { .. } => Err(format!("tool call '{}' denied by {reviewer}", request.tool_name)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn unique_name(registry: &HashMap<String, BridgedTool>, base: String) -> String {
    if !registry.contains_key(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}_{n}");
        if !registry.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn describe(server_name: &str, tool: &McpToolDef) -> String {
    let body = if tool.description.trim().is_empty() {
        tool.name.as_str()
    } else {
        tool.description.as_str()
    };
    format!("[MCP Server: {server_name}] {body}")
}

/// Normalize an input schema to an object schema with explicit
/// `properties`, `required` and `additionalProperties`.
fn parameter_schema(input: &Value) -> Value {
    json!({
        "type": "object",
        "properties": input.get("properties").cloned().unwrap_or_else(|| json!({})),
        "required": input.get("required").cloned().unwrap_or_else(|| json!([])),
        "additionalProperties": input.get("additionalProperties").cloned().unwrap_or(Value::Bool(false)),
    })
}

const CRITICAL_KEYWORDS: &[&str] = &[
    "system", "admin", "root", "sudo", "elevated", "registry", "service", "process", "kernel", "database",
    "sql", "inject", "exploit",
];

const HIGH_KEYWORDS: &[&str] = &[
    "execute", "run", "command", "shell", "powershell", "cmd", "delete", "remove", "destroy", "kill",
    "terminate", "write", "create", "modify", "update", "install", "uninstall", "network", "http",
    "request", "download", "upload", "file", "directory", "folder", "path",
];

const MEDIUM_KEYWORDS: &[&str] = &[
    "search", "find", "query", "filter", "sort", "parse", "format", "convert", "transform", "analyze",
    "calculate", "compute",
];

/// Risk judged from the tool's own name, description and parameter names.
pub fn analyze_risk(tool: &McpToolDef) -> RiskLevel {
    let name = tool.name.to_lowercase();
    let description = tool.description.to_lowercase();
    let mentions = |keywords: &[&str]| keywords.iter().any(|k| name.contains(k) || description.contains(k));

    if mentions(CRITICAL_KEYWORDS) {
        return RiskLevel::Critical;
    }
    if mentions(HIGH_KEYWORDS) {
        return RiskLevel::High;
    }
    if mentions(MEDIUM_KEYWORDS) {
        return RiskLevel::Medium;
    }

    let params: Vec<String> = tool
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().map(|k| k.to_lowercase()).collect())
        .unwrap_or_default();
    let any_param = |keywords: &[&str]| params.iter().any(|p| keywords.iter().any(|k| p.contains(k)));

    if any_param(&["command", "script", "execute"]) {
        RiskLevel::High
    } else if any_param(&["file", "path", "directory"]) {
        RiskLevel::Medium
    } else if !params.is_empty() {
        RiskLevel::Low
    } else {
        RiskLevel::None
    }
}

/// Turn a `tools/call` result into model-facing text.
pub fn convert_result(result: &ToolCallResult) -> ToolOutput {
    if result.is_error {
        return ToolOutput::error(result.first_text().unwrap_or("MCP tool execution failed"));
    }
    if result.content.is_empty() {
        return ToolOutput::ok("MCP tool completed successfully");
    }

    let parts: Vec<String> = result
        .content
        .iter()
        .map(|item| match (item.content_type.as_str(), item.text.as_deref()) {
            ("text", Some(text)) => text.to_string(),
            ("json", Some(text)) => serde_json::from_str::<Value>(text)
                .and_then(|v| serde_json::to_string_pretty(&v))
                .unwrap_or_else(|_| text.to_string()),
            _ => serde_json::to_string_pretty(item).unwrap_or_default(),
        })
        .collect();
    ToolOutput::ok(parts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolCallContent;

    fn tool(name: &str, description: &str, schema: Value) -> McpToolDef {
        McpToolDef {
            name: name.into(),
            description: description.into(),
            input_schema: schema,
        }
    }

    #[test]
    fn sanitize_maps_punctuation() {
        assert_eq!(sanitize("fs.read-text"), "fs_read_text");
        assert_eq!(sanitize("plain42"), "plain42");
    }

    #[test]
    fn colliding_names_get_a_suffix() {
        let mut registry = HashMap::new();
        let entry = BridgedTool {
            function_name: "mcp_a_b".into(),
            server_id: "a".into(),
            server_name: "a".into(),
            tool_name: "b".into(),
            risk_level: RiskLevel::None,
        };
        registry.insert("mcp_a_b".to_string(), entry.clone());
        assert_eq!(unique_name(&registry, "mcp_a_b".into()), "mcp_a_b_2");
        registry.insert("mcp_a_b_2".to_string(), entry);
        assert_eq!(unique_name(&registry, "mcp_a_b".into()), "mcp_a_b_3");
    }

    #[test]
    fn description_falls_back_to_tool_name() {
        let t = tool("echo", "", json!({}));
        assert_eq!(describe("Demo", &t), "[MCP Server: Demo] echo");
        let t = tool("echo", "Echo input", json!({}));
        assert_eq!(describe("Demo", &t), "[MCP Server: Demo] Echo input");
    }

    #[test]
    fn schema_is_normalized() {
        let schema = parameter_schema(&json!({
            "type": "object",
            "properties": { "q": { "type": "string" } },
            "required": ["q"]
        }));
        assert_eq!(schema["properties"]["q"]["type"], "string");
        assert_eq!(schema["required"], json!(["q"]));
        assert_eq!(schema["additionalProperties"], false);

        let empty = parameter_schema(&json!({}));
        assert_eq!(empty["properties"], json!({}));
        assert_eq!(empty["required"], json!([]));
    }

    #[test]
    fn risk_from_keywords() {
        assert_eq!(analyze_risk(&tool("exec_sql", "", json!({}))), RiskLevel::Critical);
        assert_eq!(analyze_risk(&tool("run_shell", "", json!({}))), RiskLevel::High);
        assert_eq!(analyze_risk(&tool("lookup", "Search the index", json!({}))), RiskLevel::Medium);
    }

    #[test]
    fn risk_from_parameters() {
        let props = |key: &str| json!({ "properties": { key: { "type": "string" } } });
        assert_eq!(analyze_risk(&tool("go", "", props("script"))), RiskLevel::High);
        assert_eq!(analyze_risk(&tool("go", "", props("target_dir"))), RiskLevel::Low);
        assert_eq!(analyze_risk(&tool("go", "", props("directory"))), RiskLevel::Medium);
        assert_eq!(analyze_risk(&tool("go", "", props("topic"))), RiskLevel::Low);
        assert_eq!(analyze_risk(&tool("go", "", json!({}))), RiskLevel::None);
    }

    #[test]
    fn error_results_carry_first_text() {
        let result = ToolCallResult {
            content: vec![ToolCallContent::text("boom")],
            is_error: true,
        };
        assert_eq!(convert_result(&result), ToolOutput::error("boom"));

        let bare = ToolCallResult {
            content: vec![],
            is_error: true,
        };
        assert_eq!(convert_result(&bare).content, "MCP tool execution failed");
    }

    #[test]
    fn success_joins_text_and_pretty_prints_json() {
        let json_item = ToolCallContent {
            content_type: "json".into(),
            text: Some(r#"{"a":1}"#.into()),
            extra: serde_json::Map::new(),
        };
        let result = ToolCallResult {
            content: vec![ToolCallContent::text("first"), json_item],
            is_error: false,
        };
        let out = convert_result(&result);
        assert!(!out.is_error);
        assert_eq!(out.content, "first\n{\n  \"a\": 1\n}");

        let empty = convert_result(&ToolCallResult::default());
        assert_eq!(empty, ToolOutput::ok("MCP tool completed successfully"));
    }
}
