use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::McpServerDefinition;
use crate::error::ConfigError;
use crate::policy::{ApprovalProcess, RiskLevel};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything needed to launch or connect to one MCP server, plus the
/// host's policy for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Key of the entry in its configuration document.
    pub server_id: String,
    /// Display name. Falls back to the server id when empty.
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Transport hint; only consulted when both `command` and `url` are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,

    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "d_true")]
    pub auto_restart: bool,
    /// Consecutive automatic restarts allowed without a healthy probe in between.
    #[serde(default = "d_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "d_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "d_max_risk_level")]
    pub max_risk_level: RiskLevel,
    #[serde(default)]
    pub approval_process: ApprovalProcess,

    /// File this entry was loaded from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_file_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(server_id: impl Into<String>) -> Self {
        let server_id = server_id.into();
        Self {
            name: server_id.clone(),
            server_id,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            transport: None,
            disabled: false,
            description: None,
            auto_start: false,
            auto_restart: true,
            max_restart_attempts: d_max_restart_attempts(),
            health_check_interval_secs: d_health_check_interval_secs(),
            max_risk_level: d_max_risk_level(),
            approval_process: ApprovalProcess::default(),
            configuration_file_path: None,
        }
    }

    pub fn with_command<I, S>(mut self, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into());
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Build a config from a document entry. Policy fields take their
    /// defaults; the host overlays its own settings afterwards.
    pub fn from_definition(
        server_id: impl Into<String>,
        def: &McpServerDefinition,
        file: Option<&Path>,
    ) -> Self {
        let mut config = Self::new(server_id);
        if let Some(description) = def.description.as_deref().filter(|d| !d.is_empty()) {
            config.name = description.to_string();
        }
        config.command = def.command.clone();
        config.args = def.args.clone();
        config.env = def.env.clone();
        config.cwd = def.cwd.clone();
        config.url = def.url.clone();
        config.transport = def.transport.clone();
        config.disabled = def.disabled;
        config.description = def.description.clone();
        config.configuration_file_path = file.map(Path::to_path_buf);
        config
    }

    /// The document entry this config saves back to.
    pub fn to_definition(&self) -> McpServerDefinition {
        McpServerDefinition {
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            disabled: self.disabled,
            description: self.description.clone(),
            transport: self.transport.clone(),
            url: self.url.clone(),
        }
    }

    /// Registry key: the server id, qualified by its configuration file
    /// when one is known so entries from different files never collide.
    pub fn qualified_id(&self) -> String {
        match &self.configuration_file_path {
            Some(path) => format!("{}#{}", path.display(), self.server_id),
            None => self.server_id.clone(),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.server_id
        } else {
            &self.name
        }
    }

    pub fn has_command(&self) -> bool {
        self.command.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    pub fn has_url(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// Check the record's invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.trim().is_empty() {
            return Err(ConfigError::EmptyServerId);
        }
        if !self.has_command() && !self.has_url() {
            return Err(ConfigError::invalid(
                &self.server_id,
                "either a command or a url is required",
            ));
        }
        if let Some(raw) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            if let Err(e) = url::Url::parse(raw) {
                return Err(ConfigError::invalid(
                    &self.server_id,
                    format!("url '{raw}' is not an absolute URI: {e}"),
                ));
            }
        }
        if self.health_check_interval_secs < 1 {
            return Err(ConfigError::invalid(
                &self.server_id,
                "health check interval must be at least 1 second",
            ));
        }
        Ok(())
    }

    /// Pick the transport for this record.
    ///
    /// Command only selects stdio, url only selects streaming. With both, an
    /// explicit hint decides and stdio is preferred when there is none.
    pub fn transport_kind(&self) -> Result<TransportKind, ConfigError> {
        match (self.has_command(), self.has_url()) {
            (true, false) => Ok(TransportKind::Stdio),
            (false, true) => Ok(TransportKind::Streaming),
            (true, true) => Ok(self
                .transport
                .as_deref()
                .map(TransportKind::from_hint)
                .unwrap_or(TransportKind::Stdio)),
            (false, false) => Err(ConfigError::invalid(
                &self.server_id,
                "no command or url to connect with",
            )),
        }
    }
}

/// Transport used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawn a local process and exchange newline-framed JSON over its stdio.
    Stdio,
    /// Long-lived HTTP event stream plus POSTed requests.
    Streaming,
}

impl TransportKind {
    pub fn from_hint(hint: &str) -> Self {
        match hint.trim().to_ascii_lowercase().as_str() {
            "sse" | "http" | "https" | "streaming" => Self::Streaming,
            _ => Self::Stdio,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_max_restart_attempts() -> u32 {
    3
}
fn d_health_check_interval_secs() -> u64 {
    30
}
fn d_max_risk_level() -> RiskLevel {
    RiskLevel::Medium
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
