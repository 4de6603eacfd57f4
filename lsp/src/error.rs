//! Error taxonomy for the LSP client.
//!
//! Three families reach callers: configuration errors (fail fast, never
//! retried), transport errors (the client for that language is left stopped
//! until the next bootstrap recreates it) and the single sync-recovery error
//! that remains once the restart rung of the recovery ladder has failed.
//! Cache failures never surface; the cache demotes itself to memory-only.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type LspResult<T> = Result<T, LspError>;

#[derive(Debug, Error)]
pub enum LspError {
    #[error("no language server configured for {}", path.display())]
    UnsupportedFile { path: PathBuf },

    #[error("no language server configured for language '{0}'")]
    UnknownLanguage(String),

    #[error("{command} not found in PATH")]
    BinaryNotFound {
        command: String,
        #[source]
        source: which::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("spawning {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{language} handshake failed: {message}")]
    Handshake { language: String, message: String },

    #[error("{method} timed out after {}s", after.as_secs())]
    Timeout { method: String, after: Duration },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("{method} failed ({code}): {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("restarting the {language} server failed: {source}")]
    RestartFailed {
        language: String,
        #[source]
        source: Box<LspError>,
    },

    #[error("{op}: {source}")]
    Operation {
        op: &'static str,
        #[source]
        source: Box<LspError>,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LspError {
    /// Tag an error with the public operation it escaped from.
    #[must_use]
    pub fn in_op(self, op: &'static str) -> Self {
        match self {
            already @ Self::Operation { .. } => already,
            other => Self::Operation {
                op,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through operation tags.
    #[must_use]
    pub fn root(&self) -> &LspError {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Caller-side mistakes and missing setup. Never retried.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.root(),
            Self::UnsupportedFile { .. }
                | Self::UnknownLanguage(_)
                | Self::BinaryNotFound { .. }
                | Self::InvalidArgument(_)
                | Self::FileNotFound { .. }
        )
    }

    /// Failures of the stdio link to a server process.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self.root(),
            Self::Spawn { .. }
                | Self::Handshake { .. }
                | Self::Timeout { .. }
                | Self::ConnectionClosed
                | Self::Protocol(_)
                | Self::Io(_)
        )
    }
}

impl From<anyhow::Error> for LspError {
    fn from(err: anyhow::Error) -> Self {
        Self::Protocol(format!("{err:#}"))
    }
}
