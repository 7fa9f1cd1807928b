//! Error types for the mock server.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the library.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration. Fatal to startup; the server never listens.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A glob pattern in `mocks` failed to compile.
    #[error("invalid glob pattern `{pattern}`: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// A proxy prefix failed to compile as a regular expression.
    #[error("invalid proxy pattern `{pattern}`: {source}")]
    ProxyPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A mock file could not be read for a reason other than absence.
    #[error("failed to load mock {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file-system watch source failed.
    #[error("watch error: {0}")]
    Watch(String),

    /// An upstream proxy call failed.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// The listen socket could not be bound.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be read.
    #[error("failed to read config {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse config {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Watch(err.to_string())
    }
}
