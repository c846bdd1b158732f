//! Public types consumed by hosts.
//!
//! These types define the interface between `polyglot-lsp` and whatever
//! drives it. Hosts construct [`LspConfig`], receive [`LspEvent`]s, and read
//! [`Diagnostic`]s, [`DiagnosticsSnapshot`]s and [`ServerStatus`] projections.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const fn default_true() -> bool {
    true
}

const fn default_request_timeout_ms() -> u64 {
    10_000
}

const fn default_diagnostics_timeout_ms() -> u64 {
    3_000
}

/// Configuration for the LSP subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct LspConfig {
    /// Master switch. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Allow missing servers to be installed on first use. Default: true.
    #[serde(default = "default_true")]
    pub auto_install: bool,
    /// Server ids disabled at startup.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Overrides the managed cache directory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_diagnostics_timeout_ms")]
    pub diagnostics_timeout_ms: u64,
    /// User-defined servers, keyed by id (e.g. "ocaml").
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_install: true,
            disabled: Vec::new(),
            cache_dir: None,
            request_timeout_ms: default_request_timeout_ms(),
            diagnostics_timeout_ms: default_diagnostics_timeout_ms(),
            servers: BTreeMap::new(),
        }
    }
}

impl LspConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn diagnostics_timeout(&self) -> Duration {
        Duration::from_millis(self.diagnostics_timeout_ms)
    }
}

/// Configuration for a single user-defined language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Display name. Defaults to the server id.
    #[serde(default)]
    pub name: Option<String>,
    /// Executable command (e.g. "ocamllsp").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// File extensions this server handles (e.g. `["ml", "mli"]`).
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// Files that indicate a workspace root (e.g. `["dune-project"]`).
    #[serde(default)]
    pub root_markers: Vec<String>,
    /// Files that rule a directory tree out for this server.
    #[serde(default)]
    pub exclude_markers: Vec<String>,
    /// Extra environment for the server process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
}

/// Identity of one client: a server scoped to one project root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey {
    pub server_id: String,
    pub root: PathBuf,
}

impl ClientKey {
    pub fn new(server_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            server_id: server_id.into(),
            root: root.into(),
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.server_id, self.root.display())
    }
}

/// Lifecycle of a server process.
///
/// Transitions only move forward: `Spawning → Running → Exited | Errored`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Spawning,
    Running,
    /// The process ended; carries the exit code when one was available.
    Exited(Option<i32>),
    Errored(String),
}

impl ProcessState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Errored(_))
    }
}

/// A zero-indexed position in a text document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

impl Location {
    /// Local path of the location, if its URI is a `file://` URI.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        crate::protocol::file_uri_to_path(&self.uri)
    }
}

/// Hover contents flattened to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hover {
    pub contents: String,
    pub range: Option<Range>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionItem {
    pub label: String,
    pub kind: Option<u32>,
    pub detail: Option<String>,
    pub documentation: Option<String>,
    pub insert_text: Option<String>,
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Map the wire value (1 through 4).
    ///
    /// Anything else is `None`.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// Extra context a server attached to a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedInformation {
    pub location: Location,
    pub message: String,
}

/// One problem a server reported for a file.
///
/// Fields are private; construction happens at the protocol boundary.
/// External consumers read via accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    range: Range,
    severity: DiagnosticSeverity,
    code: Option<String>,
    source: Option<String>,
    message: String,
    related: Vec<RelatedInformation>,
    tags: Vec<u8>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(severity: DiagnosticSeverity, message: impl Into<String>, range: Range) -> Self {
        Self {
            range,
            severity,
            code: None,
            source: None,
            message: message.into(),
            related: Vec::new(),
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_related(mut self, related: Vec<RelatedInformation>) -> Self {
        self.related = related;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<u8>) -> Self {
        self.tags = tags;
        self
    }

    /// Attribute the diagnostic to `server` unless it already names a source.
    pub(crate) fn tagged_with(mut self, server: &str) -> Self {
        if self.source.is_none() {
            self.source = Some(server.to_string());
        }
        self
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Source of the diagnostic (e.g. "ts", "pyright").
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn related(&self) -> &[RelatedInformation] {
        &self.related
    }

    /// LSP diagnostic tags (1 = unnecessary, 2 = deprecated).
    #[must_use]
    pub fn tags(&self) -> &[u8] {
        &self.tags
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.range.start.line + 1,
            self.range.start.character + 1,
            self.severity.label(),
            self.source.as_deref().unwrap_or("unknown"),
            self.message,
        )
    }
}

/// An event emitted by the manager to its host.
#[derive(Debug, Clone)]
pub enum LspEvent {
    /// A server published diagnostics for a file.
    Diagnostics {
        server: String,
        path: PathBuf,
        diagnostics: Vec<Diagnostic>,
    },
    /// A client finished initializing and is serving requests.
    ServerStarted { key: ClientKey },
    /// A client's process went away.
    ServerClosed { key: ClientKey, state: ProcessState },
    /// A server was enabled or disabled.
    ServerStatusChanged { server: String, enabled: bool },
}

/// Immutable snapshot of diagnostics across files.
///
/// Counts are computed from `files`, never cached alongside it.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Files with errors first, then by path.
    files: Vec<(PathBuf, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(PathBuf, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[(PathBuf, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// `E:<errors> W:<warnings>`, for status lines.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}

/// Read-only view of one registered server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub id: String,
    pub name: String,
    pub extensions: Vec<String>,
    pub enabled: bool,
    pub installed: bool,
    pub installable: bool,
    /// Roots with a live client for this server.
    pub running: Vec<PathBuf>,
}

impl ServerStatus {
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Number of live clients.
    #[must_use]
    pub fn instances(&self) -> usize {
        self.running.len()
    }
}

/// Read-only view of the managed install cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub path: PathBuf,
    /// Contents of the version marker, if present.
    pub version: Option<String>,
    /// Executables in the cache's `bin/` directory.
    pub binaries: Vec<String>,
    pub has_packages: bool,
    pub size_bytes: u64,
}
