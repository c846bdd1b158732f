//! On-demand language server support.
//!
//! [`LspManager`] routes files to language servers by extension, resolves a
//! project root per server, installs missing servers into a managed cache,
//! and aggregates results and diagnostics across every server that applies.

pub mod client;
pub mod codec;
pub mod error;
pub mod install;
pub mod process;
pub mod registry;
pub mod types;

pub(crate) mod diagnostics;
pub(crate) mod protocol;

mod manager;

pub use client::{ClientEvent, ClientOptions, ProtocolClient};
pub use error::{InstallError, LspError};
pub use install::Installer;
pub use manager::LspManager;
pub use process::ServerProcess;
pub use protocol::language_id_for_path;
pub use registry::{Registry, ServerDefinition, ServerSpec, SpawnContext};
pub use types::{
    CacheInfo, ClientKey, CompletionItem, Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot,
    Hover, Location, LspConfig, LspEvent, Position, ProcessState, Range, ServerConfig,
    ServerStatus,
};
