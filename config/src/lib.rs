//! Configuration for polyglot, read from `~/.polyglot/config.toml`.
//!
//! ```toml
//! [lsp]
//! auto_install = true
//! disabled = ["eslint"]
//!
//! [lsp.servers.ocaml]
//! command = "ocamllsp"
//! file_extensions = ["ml", "mli"]
//! root_markers = ["dune-project"]
//! ```

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use polyglot_lsp::LspConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PolyglotConfig {
    #[serde(default)]
    pub lsp: LspConfig,
}

impl PolyglotConfig {
    /// Load the user config. A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::parse(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Parse config text and expand `${VAR}` references in custom servers.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.expand_env(|name| env::var(name).ok());
        Ok(config)
    }

    fn expand_env(&mut self, lookup: impl Fn(&str) -> Option<String> + Copy) {
        for server in self.lsp.servers.values_mut() {
            server.command = expand_env_vars_with(&server.command, lookup);
            for arg in &mut server.args {
                *arg = expand_env_vars_with(arg, lookup);
            }
            for value in server.env.values_mut() {
                *value = expand_env_vars_with(value, lookup);
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Persist a server's enabled state in `[lsp] disabled`.
    ///
    /// Uses `toml_edit` to preserve comments and formatting.
    /// Creates the config file and parent directory if they don't exist.
    pub fn persist_server_enabled(id: &str, enabled: bool) -> io::Result<()> {
        let path = config_path().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "Could not determine config path")
        })?;
        persist_server_enabled_at(&path, id, enabled)
    }
}

/// Edit the `[lsp] disabled` array of the config file at `path`.
pub fn persist_server_enabled_at(path: &Path, id: &str, enabled: bool) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let content = if path.exists() {
        fs::read_to_string(path)?
    } else {
        String::new()
    };

    let mut doc = content
        .parse::<toml_edit::DocumentMut>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if !doc.contains_key("lsp") {
        doc["lsp"] = toml_edit::Item::Table(toml_edit::Table::new());
    }
    let lsp = doc["lsp"]
        .as_table_like_mut()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "`lsp` is not a table"))?;
    if lsp.get("disabled").is_none() {
        lsp.insert("disabled", toml_edit::value(toml_edit::Array::new()));
    }
    let disabled = lsp
        .get_mut("disabled")
        .and_then(toml_edit::Item::as_array_mut)
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "`lsp.disabled` is not an array")
        })?;

    let listed = disabled.iter().any(|v| v.as_str() == Some(id));
    if enabled {
        disabled.retain(|v| v.as_str() != Some(id));
    } else if !listed {
        disabled.push(id);
    }

    // Write back atomically
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(doc.to_string().as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Replace `${VAR}` with the variable's value. Unset variables expand to
/// nothing; an unclosed `${` or an empty name is kept literally.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    expand_env_vars_with(value, |name| env::var(name).ok())
}

pub fn expand_env_vars_with(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find("${") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                out.push_str(&lookup(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".polyglot").join("config.toml"))
}
