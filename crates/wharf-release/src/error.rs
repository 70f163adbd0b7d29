//! Error types for release actions

use std::path::PathBuf;

/// Result type for release actions
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while running a chart action
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The chart tool or release engine failed to start or exited non-zero
    #[error("{program} failed: {message}")]
    ExternalProcess {
        /// Binary that failed (e.g., "helm", "tiller")
        program: String,
        /// Exit status or spawn error, plus captured stderr when available
        message: String,
    },

    /// A resource the action depends on does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Reading or updating the resource store failed
    #[error("store error: {0}")]
    Store(String),

    /// The template version cannot be materialized as a chart directory
    #[error("invalid template: {0}")]
    Template(String),

    /// The action was cancelled before it completed
    #[error("release action cancelled")]
    Cancelled,

    /// Filesystem error while writing chart files
    #[error("io error at {path}: {source}")]
    Io {
        /// Path being written
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

impl Error {
    /// Create an external process error
    pub fn process(program: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ExternalProcess {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Create a filesystem error for `path`
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ref resp) if resp.code == 404 => Error::NotFound(resp.message.clone()),
            other => Error::Store(other.to_string()),
        }
    }
}
