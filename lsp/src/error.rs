//! Error types for the LSP subsystem.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Failure of a single client operation.
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("request `{method}` timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },
    #[error("`{method}` failed with code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("connection to language server closed")]
    ConnectionClosed,
    #[error("cannot convert path to file URI: {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("reading {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serializing message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure to acquire a server binary.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("unknown language server `{0}`")]
    UnknownServer(String),
    #[error("`{0}` is required to install this server but was not found on PATH")]
    ToolMissing(String),
    #[error("`{program}` failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("no release asset of {repo} matches {platform}")]
    NoMatchingAsset { repo: String, platform: String },
    #[error("`{0}` not found after install")]
    BinaryMissing(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl InstallError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}
