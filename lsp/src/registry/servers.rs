//! The built-in server catalog, one type per acquisition strategy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde_json::{Value, json};

use super::{InstallFut, ServerDefinition, ServerSpec, SpawnContext, SpawnFut, acquire};
use crate::install::{Arch, Installer, Os, Platform, ReleaseSpec};
use crate::process::ServerProcess;

fn owned_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| (*a).to_string()).collect()
}

fn start(
    id: &str,
    program: &Path,
    args: &[&str],
    root: &Path,
    options: Value,
) -> anyhow::Result<ServerProcess> {
    tracing::info!(server = %id, root = %root.display(), program = %program.display(), "Starting language server");
    let process = ServerProcess::spawn(program, &owned_args(args), root, &BTreeMap::new())
        .with_context(|| format!("spawning {}", program.display()))?;
    Ok(process.with_initialization_options(options))
}

fn empty_options() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A server shipped as an npm package, installed into the cache's package
/// tree.
pub struct PackageServer {
    spec: ServerSpec,
    packages: &'static [&'static str],
    binary: &'static str,
    args: &'static [&'static str],
}

impl PackageServer {
    pub fn new(
        spec: ServerSpec,
        packages: &'static [&'static str],
        binary: &'static str,
        args: &'static [&'static str],
    ) -> Self {
        Self {
            spec,
            packages,
            binary,
            args,
        }
    }

    fn resolve(&self, installer: &Installer) -> Option<PathBuf> {
        let cached = installer.package_bin_path(self.binary);
        if cached.is_file() {
            return Some(cached);
        }
        installer.resolve(self.binary)
    }

    async fn acquire(&self, ctx: SpawnContext<'_>) -> anyhow::Result<Option<PathBuf>> {
        Ok(acquire(self, ctx, self.resolve(ctx.installer)).await?)
    }
}

impl ServerDefinition for PackageServer {
    fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    fn installable(&self) -> bool {
        true
    }

    fn check_installed(&self, installer: &Installer) -> bool {
        self.resolve(installer).is_some()
    }

    fn install<'a>(&'a self, installer: &'a Installer) -> InstallFut<'a> {
        Box::pin(installer.install_packages(self.packages, self.binary))
    }

    fn spawn<'a>(&'a self, ctx: SpawnContext<'a>) -> SpawnFut<'a> {
        Box::pin(async move {
            let Some(program) = self.acquire(ctx).await? else {
                return Ok(None);
            };
            start(&self.spec.id, &program, self.args, ctx.root, empty_options()).map(Some)
        })
    }
}

/// `typescript-language-server`, pointed at a concrete `tsserver.js`.
pub struct TypeScriptServer {
    package: PackageServer,
}

impl TypeScriptServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            package: PackageServer::new(
                ServerSpec::new(
                    "typescript",
                    "TypeScript",
                    &["ts", "tsx", "js", "jsx", "mjs", "cjs", "mts", "cts"],
                )
                .roots(&["tsconfig.json", "jsconfig.json", "package.json"])
                .excludes(&["deno.json", "deno.jsonc"]),
                &["typescript-language-server", "typescript"],
                "typescript-language-server",
                &["--stdio"],
            ),
        }
    }

    /// Prefer the project's own TypeScript, then the cached one.
    fn tsserver_path(root: &Path, installer: &Installer) -> Option<PathBuf> {
        let relative = Path::new("node_modules")
            .join("typescript")
            .join("lib")
            .join("tsserver.js");
        [root.join(&relative), installer.packages_dir().join(&relative)]
            .into_iter()
            .find(|candidate| candidate.is_file())
    }
}

impl Default for TypeScriptServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerDefinition for TypeScriptServer {
    fn spec(&self) -> &ServerSpec {
        &self.package.spec
    }

    fn installable(&self) -> bool {
        true
    }

    fn check_installed(&self, installer: &Installer) -> bool {
        self.package.check_installed(installer)
    }

    fn install<'a>(&'a self, installer: &'a Installer) -> InstallFut<'a> {
        self.package.install(installer)
    }

    fn spawn<'a>(&'a self, ctx: SpawnContext<'a>) -> SpawnFut<'a> {
        Box::pin(async move {
            let Some(program) = self.package.acquire(ctx).await? else {
                return Ok(None);
            };
            let options = match Self::tsserver_path(ctx.root, ctx.installer) {
                Some(path) => json!({ "tsserver": { "path": path } }),
                None => empty_options(),
            };
            start(&self.package.spec.id, &program, self.package.args, ctx.root, options).map(Some)
        })
    }
}

/// A server that must already be installed by the user.
pub struct GlobalServer {
    spec: ServerSpec,
    command: &'static str,
    args: &'static [&'static str],
}

impl GlobalServer {
    pub fn new(spec: ServerSpec, command: &'static str, args: &'static [&'static str]) -> Self {
        Self {
            spec,
            command,
            args,
        }
    }
}

impl ServerDefinition for GlobalServer {
    fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    fn installable(&self) -> bool {
        false
    }

    fn check_installed(&self, _installer: &Installer) -> bool {
        which::which(self.command).is_ok()
    }

    fn install<'a>(&'a self, _installer: &'a Installer) -> InstallFut<'a> {
        let tool = self.command.to_string();
        Box::pin(async move { Err(crate::error::InstallError::ToolMissing(tool)) })
    }

    fn spawn<'a>(&'a self, ctx: SpawnContext<'a>) -> SpawnFut<'a> {
        Box::pin(async move {
            let Ok(program) = which::which(self.command) else {
                tracing::debug!(server = %self.spec.id, command = self.command, "Not on PATH");
                return Ok(None);
            };
            start(&self.spec.id, &program, self.args, ctx.root, empty_options()).map(Some)
        })
    }
}

/// A server built with its language's own toolchain (`go install`).
pub struct ToolchainServer {
    spec: ServerSpec,
    module: &'static str,
    binary: &'static str,
    args: &'static [&'static str],
}

impl ToolchainServer {
    pub fn new(
        spec: ServerSpec,
        module: &'static str,
        binary: &'static str,
        args: &'static [&'static str],
    ) -> Self {
        Self {
            spec,
            module,
            binary,
            args,
        }
    }
}

impl ServerDefinition for ToolchainServer {
    fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    fn installable(&self) -> bool {
        true
    }

    fn check_installed(&self, installer: &Installer) -> bool {
        installer.resolve(self.binary).is_some()
    }

    fn install<'a>(&'a self, installer: &'a Installer) -> InstallFut<'a> {
        Box::pin(installer.go_install(self.module, self.binary))
    }

    fn spawn<'a>(&'a self, ctx: SpawnContext<'a>) -> SpawnFut<'a> {
        Box::pin(async move {
            let resolved = ctx.installer.resolve(self.binary);
            let Some(program) = acquire(self, ctx, resolved).await? else {
                return Ok(None);
            };
            start(&self.spec.id, &program, self.args, ctx.root, empty_options()).map(Some)
        })
    }
}

/// A server downloaded from a GitHub release.
pub struct ReleaseServer {
    spec: ServerSpec,
    release: ReleaseSpec,
    args: &'static [&'static str],
}

impl ReleaseServer {
    pub fn new(spec: ServerSpec, release: ReleaseSpec, args: &'static [&'static str]) -> Self {
        Self {
            spec,
            release,
            args,
        }
    }
}

impl ServerDefinition for ReleaseServer {
    fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    fn installable(&self) -> bool {
        true
    }

    fn check_installed(&self, installer: &Installer) -> bool {
        installer.resolve(self.release.binary).is_some()
    }

    fn install<'a>(&'a self, installer: &'a Installer) -> InstallFut<'a> {
        Box::pin(installer.install_release(&self.release))
    }

    fn spawn<'a>(&'a self, ctx: SpawnContext<'a>) -> SpawnFut<'a> {
        Box::pin(async move {
            let resolved = ctx.installer.resolve(self.release.binary);
            let Some(program) = acquire(self, ctx, resolved).await? else {
                return Ok(None);
            };
            start(&self.spec.id, &program, self.args, ctx.root, empty_options()).map(Some)
        })
    }
}

fn rust_analyzer_asset(platform: Platform, name: &str) -> bool {
    let Some(target) = platform.rust_target() else {
        return false;
    };
    let ext = if platform.os == Os::Windows { "zip" } else { "gz" };
    name == format!("rust-analyzer-{target}.{ext}")
}

/// `clangd-linux-19.1.2.zip`, `clangd-mac-…`, `clangd-windows-…`.
fn clangd_asset(platform: Platform, name: &str) -> bool {
    let os = match (platform.os, platform.arch) {
        (Os::Linux, Arch::X64) => "linux",
        (Os::MacOs, _) => "mac",
        (Os::Windows, Arch::X64) => "windows",
        _ => return false,
    };
    name.starts_with(&format!("clangd-{os}-")) && name.ends_with(".zip")
}

/// `zls-x86_64-linux.tar.xz`, `zls-aarch64-macos.tar.xz`, `zls-x86_64-windows.zip`.
fn zls_asset(platform: Platform, name: &str) -> bool {
    let arch = match platform.arch {
        Arch::X64 => "x86_64",
        Arch::Arm64 => "aarch64",
        Arch::Other => return false,
    };
    let (os, ext) = match platform.os {
        Os::Linux => ("linux", "tar.xz"),
        Os::MacOs => ("macos", "tar.xz"),
        Os::Windows => ("windows", "zip"),
        Os::Other => return false,
    };
    name == format!("zls-{arch}-{os}.{ext}")
}

/// `marksman-linux-x64`, `marksman-linux-arm64`, `marksman-macos`, `marksman.exe`.
fn marksman_asset(platform: Platform, name: &str) -> bool {
    match (platform.os, platform.arch) {
        (Os::Linux, Arch::X64) => name == "marksman-linux-x64",
        (Os::Linux, Arch::Arm64) => name == "marksman-linux-arm64",
        (Os::MacOs, _) => name == "marksman-macos",
        (Os::Windows, Arch::X64) => name == "marksman.exe",
        _ => false,
    }
}

pub(super) fn builtin() -> Vec<Arc<dyn ServerDefinition>> {
    vec![
        Arc::new(TypeScriptServer::new()),
        Arc::new(GlobalServer::new(
            ServerSpec::new("deno", "Deno", &["ts", "tsx", "js", "jsx", "mjs"])
                .roots(&["deno.json", "deno.jsonc"]),
            "deno",
            &["lsp"],
        )),
        Arc::new(PackageServer::new(
            ServerSpec::new("vue", "Vue", &["vue"]).roots(&["package.json"]),
            &["@vue/language-server", "typescript"],
            "vue-language-server",
            &["--stdio"],
        )),
        Arc::new(PackageServer::new(
            ServerSpec::new(
                "eslint",
                "ESLint",
                &["ts", "tsx", "js", "jsx", "mjs", "cjs", "mts", "cts", "vue"],
            )
            .roots(&["eslint.config.*", ".eslintrc*"]),
            &["vscode-langservers-extracted"],
            "vscode-eslint-language-server",
            &["--stdio"],
        )),
        Arc::new(PackageServer::new(
            ServerSpec::new(
                "tailwindcss",
                "Tailwind CSS",
                &["css", "scss", "html", "jsx", "tsx", "vue", "svelte", "astro"],
            )
            .roots(&["tailwind.config.*"]),
            &["@tailwindcss/language-server"],
            "tailwindcss-language-server",
            &["--stdio"],
        )),
        Arc::new(PackageServer::new(
            ServerSpec::new("pyright", "Pyright", &["py", "pyi"]).roots(&[
                "pyproject.toml",
                "pyrightconfig.json",
                "setup.py",
                "setup.cfg",
                "requirements.txt",
                "Pipfile",
            ]),
            &["pyright"],
            "pyright-langserver",
            &["--stdio"],
        )),
        Arc::new(PackageServer::new(
            ServerSpec::new("bash", "Bash", &["sh", "bash", "zsh"]),
            &["bash-language-server"],
            "bash-language-server",
            &["start"],
        )),
        Arc::new(PackageServer::new(
            ServerSpec::new("yaml", "YAML", &["yaml", "yml"]),
            &["yaml-language-server"],
            "yaml-language-server",
            &["--stdio"],
        )),
        Arc::new(ToolchainServer::new(
            ServerSpec::new("gopls", "gopls", &["go"]).roots(&["go.work", "go.mod"]),
            "golang.org/x/tools/gopls@latest",
            "gopls",
            &[],
        )),
        Arc::new(ReleaseServer::new(
            ServerSpec::new("rust-analyzer", "rust-analyzer", &["rs"]).roots(&["Cargo.toml"]),
            ReleaseSpec {
                repo: "rust-lang/rust-analyzer",
                binary: "rust-analyzer",
                matcher: rust_analyzer_asset,
            },
            &[],
        )),
        Arc::new(ReleaseServer::new(
            ServerSpec::new(
                "clangd",
                "clangd",
                &["c", "h", "cpp", "cc", "cxx", "hpp", "hh", "hxx"],
            )
            .roots(&[
                "compile_commands.json",
                "compile_flags.txt",
                ".clangd",
                "CMakeLists.txt",
                "Makefile",
            ]),
            ReleaseSpec {
                repo: "clangd/clangd",
                binary: "clangd",
                matcher: clangd_asset,
            },
            &["--background-index"],
        )),
        Arc::new(ReleaseServer::new(
            ServerSpec::new("zls", "zls", &["zig", "zon"]).roots(&["build.zig"]),
            ReleaseSpec {
                repo: "zigtools/zls",
                binary: "zls",
                matcher: zls_asset,
            },
            &[],
        )),
        Arc::new(ReleaseServer::new(
            ServerSpec::new("marksman", "Marksman", &["md", "markdown"]),
            ReleaseSpec {
                repo: "artempyanykh/marksman",
                binary: "marksman",
                matcher: marksman_asset,
            },
            &["server"],
        )),
    ]
}
