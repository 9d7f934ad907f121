use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("state encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to persist state to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("firewall command `{command}` failed: {message}")]
    Firewall { command: String, message: String },

    #[error("firewall command `{command}` timed out after {timeout:?}")]
    FirewallTimeout { command: String, timeout: Duration },

    #[error("no firewall rule matching `{rule}`")]
    RuleNotFound { rule: String },

    #[error("mapping not found")]
    MappingNotFound,

    #[error("mapping already exists")]
    DuplicateMapping,
}

pub type Result<T> = std::result::Result<T, Error>;
