//! Ecosystem package installs into the cache's isolated package tree.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use super::{Installer, require_tool, run_tool};
use crate::error::InstallError;

const MANIFEST: &str = "package.json";

/// Create a minimal manifest so the package manager treats `dir` as a
/// project of its own instead of walking up to an enclosing one.
pub(crate) async fn ensure_manifest(dir: &Path) -> Result<(), InstallError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(InstallError::io(format!("creating {}", dir.display())))?;
    let manifest = dir.join(MANIFEST);
    if tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
        return Ok(());
    }
    let contents = serde_json::json!({
        "name": "polyglot-language-servers",
        "private": true,
        "dependencies": {}
    });
    tokio::fs::write(&manifest, format!("{contents:#}\n"))
        .await
        .map_err(InstallError::io(format!("writing {}", manifest.display())))
}

impl Installer {
    /// Install `packages` and return the path of the executable `binary`
    /// they provide.
    ///
    /// Uses `bun` when available, otherwise `npm`.
    pub async fn install_packages(
        &self,
        packages: &[&str],
        binary: &str,
    ) -> Result<PathBuf, InstallError> {
        let target = self.package_bin_path(binary);
        if target.exists() {
            return Ok(target);
        }

        let _guard = self.package_lock.lock().await;
        // Another install may have provided the binary while we waited.
        if target.exists() {
            return Ok(target);
        }

        let dir = self.packages_dir();
        ensure_manifest(&dir).await?;

        let (tool, mut args): (PathBuf, Vec<&OsStr>) = match require_tool("bun") {
            Ok(bun) => (bun, vec![OsStr::new("add"), OsStr::new("--exact")]),
            Err(_) => (
                require_tool("npm")?,
                vec![
                    OsStr::new("install"),
                    OsStr::new("--no-audit"),
                    OsStr::new("--no-fund"),
                    OsStr::new("--save-exact"),
                ],
            ),
        };
        args.extend(packages.iter().map(OsStr::new));

        tracing::info!(?packages, dir = %dir.display(), "Installing language server packages");
        run_tool(&tool, &args, |cmd| {
            cmd.current_dir(&dir);
        })
        .await?;

        if target.exists() {
            Ok(target)
        } else {
            Err(InstallError::BinaryMissing(binary.to_string()))
        }
    }
}
