//! Finding, reading, validating and writing `mcp.json` files.
//!
//! The document format is the one shared by most MCP hosts: a top-level
//! `mcpServers` (or `servers`) map from server id to launch definition.
//! Comments and trailing commas are accepted on read; writes are strict,
//! pretty-printed JSON under `mcpServers`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use mf_domain::config::{McpConfigDocument, McpServerDefinition, ServerConfig};
use mf_domain::error::ConfigError;

use crate::jsonc;
use crate::paths;

pub const CONFIG_FILE_NAME: &str = "mcp.json";

/// Locations checked before the recursive walk, in order. Relative entries
/// resolve against the discovery base directory.
pub const STANDARD_CONFIG_PATHS: [&str; 5] = [
    "mcp.json",
    ".mcp/mcp.json",
    "~/.config/mcp/mcp.json",
    "%APPDATA%/mcp/mcp.json",
    "%USERPROFILE%/.config/mcp/mcp.json",
];

/// Default depth of the recursive walk. The base directory is depth 0 and
/// directories at depth 3 are still searched.
pub const DEFAULT_SEARCH_DEPTH: usize = 3;

/// Dependency and build directories never worth descending into.
const SKIPPED_DIRS: [&str; 4] = ["node_modules", "bin", "obj", "target"];

/// Dotted directory that is searched despite the leading dot.
const CONFIG_DIR: &str = ".mcp";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An entry that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedServer {
    pub server_id: String,
    pub reason: String,
}

/// A parsed configuration file.
#[derive(Debug, Clone)]
pub struct LoadedConfiguration {
    pub path: PathBuf,
    pub document: McpConfigDocument,
    /// Valid entries, including disabled ones, in id order.
    pub servers: Vec<ServerConfig>,
    pub rejected: Vec<RejectedServer>,
}

impl LoadedConfiguration {
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|s| !s.disabled)
    }
}

/// Read and validate one configuration file.
///
/// Invalid entries are dropped and listed in `rejected`; the file only fails
/// as a whole when it is unreadable, malformed, empty, or has no valid entry.
pub fn load(path: &Path) -> Result<LoadedConfiguration, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document = parse_document(&text, path)?;
    let loaded = from_document(document, path)?;

    tracing::debug!(
        path = %path.display(),
        servers = loaded.servers.len(),
        rejected = loaded.rejected.len(),
        "loaded MCP configuration"
    );
    Ok(loaded)
}

/// Parse document text. `path` is only used in errors.
pub fn parse_document(text: &str, path: &Path) -> Result<McpConfigDocument, ConfigError> {
    serde_json::from_str(&jsonc::to_strict_json(text)).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Validate a parsed document and turn its entries into server configs.
pub fn from_document(document: McpConfigDocument, path: &Path) -> Result<LoadedConfiguration, ConfigError> {
    let definitions = document.all_servers();
    if definitions.is_empty() {
        return Err(ConfigError::NoServers(path.to_path_buf()));
    }

    let mut servers = Vec::new();
    let mut rejected = Vec::new();
    for (id, definition) in &definitions {
        let config = ServerConfig::from_definition(id.as_str(), definition, Some(path));
        match config.validate() {
            Ok(()) => servers.push(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), server_id = %id, error = %e, "rejecting MCP server entry");
                rejected.push(RejectedServer {
                    server_id: id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if servers.is_empty() {
        return Err(ConfigError::NoValidServers(path.to_path_buf()));
    }
    Ok(LoadedConfiguration {
        path: path.to_path_buf(),
        document,
        servers,
        rejected,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Saving
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Write a document, creating the parent directory if needed.
pub fn save(path: &Path, document: &McpConfigDocument) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut json = serde_json::to_string_pretty(document).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    json.push('\n');
    std::fs::write(path, json).map_err(write_err)?;
    tracing::debug!(path = %path.display(), "saved MCP configuration");
    Ok(())
}

/// Write servers back to the files they came from. Servers without a
/// source file go to `default_path`. Returns the files written.
pub fn save_servers(servers: &[ServerConfig], default_path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut by_file: BTreeMap<PathBuf, BTreeMap<String, McpServerDefinition>> = BTreeMap::new();
    for server in servers {
        let file = server
            .configuration_file_path
            .clone()
            .unwrap_or_else(|| default_path.to_path_buf());
        by_file
            .entry(file)
            .or_default()
            .insert(server.server_id.clone(), server.to_definition());
    }

    let mut written = Vec::with_capacity(by_file.len());
    for (file, definitions) in by_file {
        save(&file, &McpConfigDocument::from_servers(definitions))?;
        written.push(file);
    }
    Ok(written)
}

/// Starter document: a filesystem server rooted at the home directory,
/// plus disabled examples that need credentials.
pub fn default_document() -> McpConfigDocument {
    let home = dirs::home_dir()
        .map(|h| h.display().to_string())
        .unwrap_or_else(|| "~".to_string());

    let npx = |package: &str, extra: Option<&str>| {
        let mut args = vec!["-y".to_string(), package.to_string()];
        args.extend(extra.map(str::to_string));
        McpServerDefinition {
            command: Some("npx".into()),
            args,
            ..McpServerDefinition::default()
        }
    };

    let mut servers = BTreeMap::new();
    servers.insert(
        "filesystem".to_string(),
        McpServerDefinition {
            description: Some("Local filesystem access".into()),
            ..npx("@modelcontextprotocol/server-filesystem", Some(&home))
        },
    );
    servers.insert(
        "brave-search".to_string(),
        McpServerDefinition {
            env: BTreeMap::from([("BRAVE_API_KEY".to_string(), "your-brave-api-key-here".to_string())]),
            description: Some("Brave search engine access".into()),
            disabled: true,
            ..npx("@modelcontextprotocol/server-brave-search", None)
        },
    );
    servers.insert(
        "github".to_string(),
        McpServerDefinition {
            env: BTreeMap::from([(
                "GITHUB_PERSONAL_ACCESS_TOKEN".to_string(),
                "your-github-token-here".to_string(),
            )]),
            description: Some("GitHub repository access".into()),
            disabled: true,
            ..npx("@modelcontextprotocol/server-github", None)
        },
    );
    McpConfigDocument::from_servers(servers)
}

/// Write [`default_document`] to `path` unless a file is already there.
/// Returns whether a file was created.
pub fn create_default_configuration(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    save(path, &default_document())?;
    tracing::info!(path = %path.display(), "created default MCP configuration");
    Ok(true)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a discovery pass found.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Successfully loaded files keyed by absolute path.
    pub configurations: BTreeMap<PathBuf, LoadedConfiguration>,
    /// Files that exist but failed to load.
    pub failures: Vec<(PathBuf, ConfigError)>,
}

impl Discovery {
    /// Enabled servers across all files, in path then id order.
    pub fn servers(&self) -> Vec<ServerConfig> {
        self.configurations
            .values()
            .flat_map(|c| c.enabled_servers().cloned())
            .collect()
    }
}

/// Standard locations resolved against `base`. Entries naming an unset
/// environment variable are skipped.
pub fn standard_paths(base: &Path) -> Vec<PathBuf> {
    STANDARD_CONFIG_PATHS
        .iter()
        .map(|raw| paths::expand_env_vars(raw))
        .filter(|expanded| !expanded.contains('%') && !expanded.contains('$'))
        .map(|expanded| paths::resolve_path(&expanded, base))
        .collect()
}

/// Check the standard locations, then walk `base` down to `max_depth`
/// looking for `mcp.json`. A file that fails to load is recorded in
/// `failures` and the search goes on.
pub fn discover(base: &Path, max_depth: usize) -> Discovery {
    let base = paths::resolve_path(&base.to_string_lossy(), &std::env::current_dir().unwrap_or_default());
    let mut discovery = Discovery::default();
    let mut visited = HashSet::new();

    for candidate in standard_paths(&base) {
        if candidate.is_file() {
            load_into(&candidate, &mut visited, &mut discovery);
        }
    }
    walk(&base, 0, max_depth, &mut visited, &mut discovery);

    tracing::info!(
        base = %base.display(),
        files = discovery.configurations.len(),
        failures = discovery.failures.len(),
        "MCP configuration discovery finished"
    );
    discovery
}

fn walk(dir: &Path, depth: usize, max_depth: usize, visited: &mut HashSet<PathBuf>, out: &mut Discovery) {
    let candidate = dir.join(CONFIG_FILE_NAME);
    if candidate.is_file() {
        load_into(&candidate, visited, out);
    }
    if depth >= max_depth {
        return;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return;
        }
    };
    let mut subdirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        // `file_type` does not follow symlinks, so link cycles are never walked.
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .filter(|entry| !is_skipped_dir(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .collect();
    subdirs.sort();

    for sub in subdirs {
        walk(&sub, depth + 1, max_depth, visited, out);
    }
}

fn is_skipped_dir(name: &str) -> bool {
    if name.starts_with('.') {
        return name != CONFIG_DIR;
    }
    SKIPPED_DIRS.iter().any(|skip| name.eq_ignore_ascii_case(skip))
}

fn load_into(path: &Path, visited: &mut HashSet<PathBuf>, out: &mut Discovery) {
    let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(key.clone()) {
        return;
    }
    match load(&key) {
        Ok(loaded) => {
            out.configurations.insert(key, loaded);
        }
        Err(e) => {
            tracing::warn!(path = %key.display(), error = %e, "failed to load MCP configuration");
            out.failures.push((key, e));
        }
    }
}
