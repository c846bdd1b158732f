//! User-configured servers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use serde_json::Value;

use super::{InstallFut, ServerDefinition, ServerSpec, SpawnContext, SpawnFut};
use crate::error::InstallError;
use crate::install::Installer;
use crate::process::ServerProcess;
use crate::types::ServerConfig;

/// A server defined in configuration. Never installed by us.
pub struct CustomServer {
    spec: ServerSpec,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    initialization_options: Value,
}

impl CustomServer {
    pub fn new(id: &str, config: &ServerConfig) -> Self {
        let extensions: Vec<&str> = config.file_extensions.iter().map(String::as_str).collect();
        let name = config.name.as_deref().unwrap_or(id);
        let mut spec = ServerSpec::new(id, name, &extensions);
        spec.root_patterns.clone_from(&config.root_markers);
        spec.exclude_patterns.clone_from(&config.exclude_markers);
        Self {
            spec,
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            initialization_options: config
                .initialization_options
                .clone()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        }
    }

    /// `which` accepts bare names and explicit paths alike.
    fn resolve(&self) -> Option<PathBuf> {
        which::which(&self.command).ok()
    }
}

impl ServerDefinition for CustomServer {
    fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    fn installable(&self) -> bool {
        false
    }

    fn check_installed(&self, _installer: &Installer) -> bool {
        self.resolve().is_some()
    }

    fn install<'a>(&'a self, _installer: &'a Installer) -> InstallFut<'a> {
        let command = self.command.clone();
        Box::pin(async move { Err(InstallError::ToolMissing(command)) })
    }

    fn spawn<'a>(&'a self, ctx: SpawnContext<'a>) -> SpawnFut<'a> {
        Box::pin(async move {
            let Some(program) = self.resolve() else {
                tracing::warn!(server = %self.spec.id, command = %self.command, "Configured language server not found");
                return Ok(None);
            };
            tracing::info!(server = %self.spec.id, root = %ctx.root.display(), "Starting language server");
            let process = ServerProcess::spawn(&program, &self.args, ctx.root, &self.env)
                .with_context(|| format!("spawning {}", program.display()))?;
            Ok(Some(
                process.with_initialization_options(self.initialization_options.clone()),
            ))
        })
    }
}
