//! Installer: acquires server binaries into a managed, versioned cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/version      cache format marker
//! <root>/bin/         flattened executables (toolchain and release installs)
//! <root>/packages/    isolated package tree (package.json + node_modules)
//! ```

mod archive;
mod cache;
mod package;
mod release;
mod toolchain;

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::error::InstallError;
use crate::types::CacheInfo;

pub use release::{AssetMatcher, ReleaseSpec};

/// Bump when the cache layout changes; older caches are wiped on startup.
pub const CACHE_VERSION: &str = "1";

const DEFAULT_API_BASE: &str = "https://api.github.com";

const USER_AGENT: &str = concat!("polyglot/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X64,
    Arm64,
    Other,
}

/// Operating system and CPU architecture used to pick release assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    #[must_use]
    pub fn current() -> Self {
        let os = if cfg!(target_os = "linux") {
            Os::Linux
        } else if cfg!(target_os = "macos") {
            Os::MacOs
        } else if cfg!(target_os = "windows") {
            Os::Windows
        } else {
            Os::Other
        };
        let arch = if cfg!(target_arch = "x86_64") {
            Arch::X64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else {
            Arch::Other
        };
        Self { os, arch }
    }

    /// Rust target triple, e.g. `x86_64-unknown-linux-gnu`.
    #[must_use]
    pub fn rust_target(self) -> Option<&'static str> {
        match (self.os, self.arch) {
            (Os::Linux, Arch::X64) => Some("x86_64-unknown-linux-gnu"),
            (Os::Linux, Arch::Arm64) => Some("aarch64-unknown-linux-gnu"),
            (Os::MacOs, Arch::X64) => Some("x86_64-apple-darwin"),
            (Os::MacOs, Arch::Arm64) => Some("aarch64-apple-darwin"),
            (Os::Windows, Arch::X64) => Some("x86_64-pc-windows-msvc"),
            (Os::Windows, Arch::Arm64) => Some("aarch64-pc-windows-msvc"),
            _ => None,
        }
    }

    fn os_label(self) -> &'static str {
        match self.os {
            Os::Linux => "linux",
            Os::MacOs => "darwin",
            Os::Windows => "windows",
            Os::Other => "unknown",
        }
    }

    fn arch_label(self) -> &'static str {
        match self.arch {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
            Arch::Other => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os_label(), self.arch_label())
    }
}

/// File name of an executable on this platform.
pub(crate) fn exe_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

/// Acquires and caches language server binaries.
pub struct Installer {
    root: PathBuf,
    http: reqwest::Client,
    api_base: String,
    /// Package managers do not tolerate concurrent installs into one tree.
    package_lock: tokio::sync::Mutex<()>,
}

impl Installer {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, InstallError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|source| InstallError::Http {
                url: String::from("<client>"),
                source,
            })?;
        Ok(Self {
            root: root.into(),
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            package_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// `<platform cache dir>/polyglot/lsp`.
    #[must_use]
    pub fn default_root() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("polyglot").join("lsp"))
    }

    /// Point release lookups at another GitHub-compatible API.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    #[must_use]
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Where a flattened executable named `name` lives in the cache.
    #[must_use]
    pub fn bin_path(&self, name: &str) -> PathBuf {
        self.bin_dir().join(exe_name(name))
    }

    /// Where a package-provided executable named `name` lives in the cache.
    #[must_use]
    pub fn package_bin_path(&self, name: &str) -> PathBuf {
        let file = if cfg!(windows) {
            format!("{name}.cmd")
        } else {
            name.to_string()
        };
        self.packages_dir()
            .join("node_modules")
            .join(".bin")
            .join(file)
    }

    /// Find `name` in the cache's `bin/`, falling back to `PATH`.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let cached = self.bin_path(name);
        if cached.is_file() {
            return Some(cached);
        }
        which::which(name).ok()
    }

    /// Bring the cache to the current version, wiping it if stale.
    pub async fn prepare(&self) -> Result<(), InstallError> {
        let wiped = cache::ensure_version(&self.root, CACHE_VERSION)
            .await
            .map_err(InstallError::io(format!(
                "preparing cache at {}",
                self.root.display()
            )))?;
        if wiped {
            tracing::info!(path = %self.root.display(), version = CACHE_VERSION, "Reset LSP install cache");
        }
        Ok(())
    }

    /// Delete everything the cache holds and rewrite the version marker.
    pub async fn clear(&self) -> Result<(), InstallError> {
        cache::wipe(&self.root, CACHE_VERSION)
            .await
            .map_err(InstallError::io(format!(
                "clearing cache at {}",
                self.root.display()
            )))
    }

    #[must_use]
    pub fn cache_info(&self) -> CacheInfo {
        cache::info(&self.root)
    }
}

/// Run an external tool to completion, capturing stderr for failures.
pub(crate) async fn run_tool(
    program: &Path,
    args: &[&OsStr],
    cmd_setup: impl FnOnce(&mut Command),
) -> Result<(), InstallError> {
    let program_name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());

    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    cmd_setup(&mut cmd);

    tracing::debug!(program = %program_name, ?args, "Running installer command");
    let output = cmd
        .output()
        .await
        .map_err(InstallError::io(format!("running {program_name}")))?;

    if output.status.success() {
        return Ok(());
    }
    Err(InstallError::CommandFailed {
        program: program_name,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Locate a required external tool on `PATH`.
pub(crate) fn require_tool(name: &str) -> Result<PathBuf, InstallError> {
    which::which(name).map_err(|_| InstallError::ToolMissing(name.to_string()))
}
