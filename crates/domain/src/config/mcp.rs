//! The `mcp.json` document shape.
//!
//! These structs mirror the file exactly; the loader in `mf-mcp-client`
//! turns each entry into a [`ServerConfig`](super::ServerConfig).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration document.
///
/// Both `mcpServers` and `servers` are accepted on read. When an id appears
/// in both maps the `mcpServers` entry wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfigDocument {
    #[serde(
        default,
        rename = "mcpServers",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub mcp_servers: BTreeMap<String, McpServerDefinition>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servers: BTreeMap<String, McpServerDefinition>,
}

impl McpConfigDocument {
    /// Build a document that stores every definition under `mcpServers`.
    pub fn from_servers(servers: BTreeMap<String, McpServerDefinition>) -> Self {
        Self {
            mcp_servers: servers,
            servers: BTreeMap::new(),
        }
    }

    /// Merged view of both maps.
    pub fn all_servers(&self) -> BTreeMap<String, McpServerDefinition> {
        let mut merged = self.servers.clone();
        for (id, def) in &self.mcp_servers {
            merged.insert(id.clone(), def.clone());
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.mcp_servers.is_empty() && self.servers.is_empty()
    }
}

/// A single server entry as written in `mcp.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerDefinition {
    /// Executable to spawn. Optional when `url` is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Transport hint (`"stdio"`, `"sse"`, `"http"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl McpServerDefinition {
    pub fn has_command(&self) -> bool {
        self.command.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    pub fn has_url(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}
