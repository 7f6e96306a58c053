use std::path::PathBuf;

/// Errors raised while loading, validating or saving server configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration {} defines no servers", .0.display())]
    NoServers(PathBuf),

    #[error("configuration {} has no valid servers", .0.display())]
    NoValidServers(PathBuf),

    #[error("server id must not be empty")]
    EmptyServerId,

    #[error("server '{server_id}': {reason}")]
    InvalidServer { server_id: String, reason: String },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn invalid(server_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidServer {
            server_id: server_id.into(),
            reason: reason.into(),
        }
    }
}
