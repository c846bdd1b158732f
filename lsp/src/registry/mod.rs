//! Server registry: which language servers exist, where they apply, and how
//! each one is acquired and spawned.

mod custom;
mod root;
mod servers;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use crate::error::InstallError;
use crate::install::Installer;
use crate::process::ServerProcess;
use crate::types::LspConfig;

pub use custom::CustomServer;
pub use root::{find_project_root, find_project_root_within};
pub use servers::{GlobalServer, PackageServer, ReleaseServer, ToolchainServer, TypeScriptServer};

pub type SpawnFut<'a> =
    Pin<Box<dyn Future<Output = anyhow::Result<Option<ServerProcess>>> + Send + 'a>>;

pub type InstallFut<'a> = Pin<Box<dyn Future<Output = Result<PathBuf, InstallError>> + Send + 'a>>;

/// Static description of a server: identity, file routing, root detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub id: String,
    pub name: String,
    /// Extensions without the leading dot, lowercase.
    pub extensions: Vec<String>,
    /// Markers that make a directory the project root, in priority order.
    /// Entries containing `*`, `?` or `[` are globs over entry names.
    pub root_patterns: Vec<String>,
    /// Markers that rule a directory tree out for this server.
    pub exclude_patterns: Vec<String>,
}

impl ServerSpec {
    pub fn new(id: &str, name: &str, extensions: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            extensions: extensions.iter().map(|e| normalize_extension(e)).collect(),
            root_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }

    #[must_use]
    pub fn roots(mut self, patterns: &[&str]) -> Self {
        self.root_patterns = patterns.iter().map(|p| (*p).to_string()).collect();
        self
    }

    #[must_use]
    pub fn excludes(mut self, patterns: &[&str]) -> Self {
        self.exclude_patterns = patterns.iter().map(|p| (*p).to_string()).collect();
        self
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

/// Everything `spawn` needs besides the definition itself.
#[derive(Clone, Copy)]
pub struct SpawnContext<'a> {
    pub root: &'a Path,
    pub installer: &'a Installer,
    /// Whether a missing binary may be installed on the spot.
    pub auto_install: bool,
}

/// One language server the manager knows how to run.
pub trait ServerDefinition: Send + Sync {
    fn spec(&self) -> &ServerSpec;

    /// Whether [`ServerDefinition::install`] can acquire the binary.
    fn installable(&self) -> bool;

    /// Whether a usable binary is present in the cache or on `PATH`.
    fn check_installed(&self, installer: &Installer) -> bool;

    fn install<'a>(&'a self, installer: &'a Installer) -> InstallFut<'a>;

    /// Start the server for `ctx.root`.
    ///
    /// `Ok(None)` means the server is unavailable here (binary missing and
    /// not installable, or a required toolchain is absent).
    fn spawn<'a>(&'a self, ctx: SpawnContext<'a>) -> SpawnFut<'a>;

    fn handles_extension(&self, ext: &str) -> bool {
        let ext = normalize_extension(ext);
        self.spec().extensions.iter().any(|e| *e == ext)
    }
}

/// Resolve a server binary, installing it when allowed.
///
/// A missing installer toolchain is not an error: the server is simply
/// unavailable.
pub(crate) async fn acquire(
    definition: &dyn ServerDefinition,
    ctx: SpawnContext<'_>,
    resolved: Option<PathBuf>,
) -> Result<Option<PathBuf>, InstallError> {
    if resolved.is_some() {
        return Ok(resolved);
    }
    let id = &definition.spec().id;
    if !ctx.auto_install || !definition.installable() {
        tracing::debug!(server = %id, "Language server binary not found");
        return Ok(None);
    }
    tracing::info!(server = %id, "Installing language server");
    match definition.install(ctx.installer).await {
        Ok(path) => Ok(Some(path)),
        Err(InstallError::ToolMissing(tool)) => {
            tracing::debug!(server = %id, %tool, "Cannot install language server without {tool}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Ordered list of server definitions.
///
/// Registration order is the tie-break when several servers answer the same
/// hover or definition request.
#[derive(Clone)]
pub struct Registry {
    definitions: Vec<Arc<dyn ServerDefinition>>,
}

impl Registry {
    /// The built-in catalog.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            definitions: servers::builtin(),
        }
    }

    /// The built-in catalog plus the configured custom servers.
    ///
    /// A custom server whose id matches a built-in replaces it in place;
    /// the rest are appended in id order.
    #[must_use]
    pub fn with_config(config: &LspConfig) -> Self {
        let mut registry = Self::builtin();
        for (id, server) in &config.servers {
            let custom: Arc<dyn ServerDefinition> = Arc::new(CustomServer::new(id, server));
            match registry.definitions.iter().position(|d| d.spec().id == *id) {
                Some(index) => {
                    tracing::debug!(server = %id, "Custom server overrides built-in definition");
                    registry.definitions[index] = custom;
                }
                None => registry.definitions.push(custom),
            }
        }
        registry
    }

    pub fn from_definitions(definitions: Vec<Arc<dyn ServerDefinition>>) -> Self {
        Self { definitions }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn ServerDefinition>> {
        self.definitions.iter().find(|d| d.spec().id == id)
    }

    #[must_use]
    pub fn definitions(&self) -> &[Arc<dyn ServerDefinition>] {
        &self.definitions
    }

    /// Definitions handling `ext`, in registration order.
    pub fn servers_for_extension(&self, ext: &str) -> Vec<Arc<dyn ServerDefinition>> {
        self.definitions
            .iter()
            .filter(|d| d.handles_extension(ext))
            .cloned()
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerConfig;

    fn ids(definitions: &[Arc<dyn ServerDefinition>]) -> Vec<String> {
        definitions.iter().map(|d| d.spec().id.clone()).collect()
    }

    #[test]
    fn test_extension_matching_ignores_case_and_dot() {
        let registry = Registry::builtin();
        assert_eq!(ids(&registry.servers_for_extension("go")), vec!["gopls"]);
        assert_eq!(ids(&registry.servers_for_extension(".GO")), vec!["gopls"]);
        assert!(registry.servers_for_extension("cobol").is_empty());
    }

    #[test]
    fn test_one_extension_matches_several_servers_in_order() {
        let registry = Registry::builtin();
        let matched = ids(&registry.servers_for_extension("ts"));
        assert_eq!(matched[0], "typescript");
        assert!(matched.contains(&"deno".to_string()));
        assert!(matched.contains(&"eslint".to_string()));
        let ts = matched.iter().position(|id| id == "typescript").unwrap();
        let eslint = matched.iter().position(|id| id == "eslint").unwrap();
        assert!(ts < eslint);
    }

    #[test]
    fn test_builtin_ids_are_unique() {
        let registry = Registry::builtin();
        let mut all = ids(registry.definitions());
        let count = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), count);
    }

    fn custom(command: &str, extensions: &[&str]) -> ServerConfig {
        ServerConfig {
            name: None,
            command: command.to_string(),
            args: Vec::new(),
            file_extensions: extensions.iter().map(|e| (*e).to_string()).collect(),
            root_markers: Vec::new(),
            exclude_markers: Vec::new(),
            env: std::collections::BTreeMap::new(),
            initialization_options: None,
        }
    }

    #[test]
    fn test_custom_servers_append_and_override() {
        let mut config = LspConfig::default();
        config
            .servers
            .insert("ocaml".to_string(), custom("ocamllsp", &["ml", "mli"]));
        config
            .servers
            .insert("gopls".to_string(), custom("/opt/gopls", &["go"]));

        let builtin_count = Registry::builtin().definitions().len();
        let registry = Registry::with_config(&config);
        assert_eq!(registry.definitions().len(), builtin_count + 1);
        assert_eq!(
            registry.definitions().last().map(|d| d.spec().id.clone()),
            Some("ocaml".to_string())
        );

        let gopls = registry.get("gopls").unwrap();
        assert!(!gopls.installable());
        assert_eq!(ids(&registry.servers_for_extension("mli")), vec!["ocaml"]);
    }
}
