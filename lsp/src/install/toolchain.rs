//! Installs through a compiled language's own toolchain.

use std::ffi::OsStr;
use std::path::PathBuf;

use super::{Installer, require_tool, run_tool};
use crate::error::InstallError;

impl Installer {
    /// `go install <module>` with the binary redirected into the cache's
    /// `bin/` via `GOBIN`.
    ///
    /// Fails with [`InstallError::ToolMissing`] when `go` is not on `PATH`.
    pub async fn go_install(&self, module: &str, binary: &str) -> Result<PathBuf, InstallError> {
        let target = self.bin_path(binary);
        if target.exists() {
            return Ok(target);
        }

        let go = require_tool("go")?;
        let bin_dir = self.bin_dir();
        tokio::fs::create_dir_all(&bin_dir)
            .await
            .map_err(InstallError::io(format!("creating {}", bin_dir.display())))?;

        tracing::info!(%module, "Installing language server with go install");
        run_tool(&go, &[OsStr::new("install"), OsStr::new(module)], |cmd| {
            cmd.env("GOBIN", &bin_dir);
        })
        .await?;

        if target.exists() {
            Ok(target)
        } else {
            Err(InstallError::BinaryMissing(binary.to_string()))
        }
    }
}
