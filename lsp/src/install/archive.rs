//! Archive extraction via the platform's native tools, and binary lookup.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{require_tool, run_tool};
use crate::error::InstallError;

/// How deep below the extraction directory a binary is searched for.
pub(crate) const MAX_SEARCH_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveKind {
    Zip,
    TarGz,
    TarXz,
    /// A single gzip-compressed file.
    Gzip,
    /// Not an archive; the download is the binary.
    Raw,
}

impl ArchiveKind {
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Self::Zip
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Self::TarGz
        } else if lower.ends_with(".tar.xz") {
            Self::TarXz
        } else if lower.ends_with(".gz") {
            Self::Gzip
        } else {
            Self::Raw
        }
    }
}

/// Unpack `archive` into `dest`, which must exist.
pub(crate) async fn extract(
    archive: &Path,
    kind: ArchiveKind,
    dest: &Path,
    binary: &str,
) -> Result<(), InstallError> {
    match kind {
        ArchiveKind::Raw => {
            let target = dest.join(super::exe_name(binary));
            tokio::fs::copy(archive, &target)
                .await
                .map_err(InstallError::io(format!("copying {}", archive.display())))?;
            Ok(())
        }
        ArchiveKind::TarGz | ArchiveKind::TarXz => {
            let flags = if kind == ArchiveKind::TarGz { "-xzf" } else { "-xJf" };
            let tar = require_tool("tar")?;
            run_tool(
                &tar,
                &[OsStr::new(flags), archive.as_os_str(), OsStr::new("-C"), dest.as_os_str()],
                |_| {},
            )
            .await
        }
        ArchiveKind::Zip => extract_zip(archive, dest).await,
        ArchiveKind::Gzip => extract_gzip(archive, dest, binary).await,
    }
}

#[cfg(not(windows))]
async fn extract_zip(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let unzip = require_tool("unzip")?;
    run_tool(
        &unzip,
        &[OsStr::new("-o"), OsStr::new("-q"), archive.as_os_str(), OsStr::new("-d"), dest.as_os_str()],
        |_| {},
    )
    .await
}

#[cfg(windows)]
async fn extract_zip(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let script = format!(
        "Expand-Archive -LiteralPath '{}' -DestinationPath '{}' -Force",
        ps_quote(archive),
        ps_quote(dest)
    );
    powershell(&script).await
}

#[cfg(not(windows))]
async fn extract_gzip(archive: &Path, dest: &Path, binary: &str) -> Result<(), InstallError> {
    // gzip decompresses in place, next to the input.
    let staged = dest.join(format!("{binary}.gz"));
    tokio::fs::copy(archive, &staged)
        .await
        .map_err(InstallError::io(format!("copying {}", archive.display())))?;
    let gzip = require_tool("gzip")?;
    run_tool(
        &gzip,
        &[OsStr::new("-d"), OsStr::new("-f"), staged.as_os_str()],
        |_| {},
    )
    .await
}

#[cfg(windows)]
async fn extract_gzip(archive: &Path, dest: &Path, binary: &str) -> Result<(), InstallError> {
    let target = dest.join(super::exe_name(binary));
    let script = format!(
        "$in = [IO.File]::OpenRead('{src}'); \
         $out = [IO.File]::Create('{dst}'); \
         $gz = New-Object IO.Compression.GZipStream($in, [IO.Compression.CompressionMode]::Decompress); \
         $gz.CopyTo($out); $gz.Dispose(); $out.Dispose(); $in.Dispose()",
        src = ps_quote(archive),
        dst = ps_quote(&target),
    );
    powershell(&script).await
}

#[cfg(windows)]
fn ps_quote(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}

#[cfg(windows)]
async fn powershell(script: &str) -> Result<(), InstallError> {
    let ps = require_tool("powershell")?;
    run_tool(
        &ps,
        &[
            OsStr::new("-NoProfile"),
            OsStr::new("-NonInteractive"),
            OsStr::new("-Command"),
            OsStr::new(script),
        ],
        |_| {},
    )
    .await
}

/// Breadth-first search for a file named `name` at most `max_depth` levels
/// below `dir`. Files directly inside `dir` are at depth 1.
pub(crate) fn find_binary(dir: &Path, name: &str, max_depth: usize) -> Option<PathBuf> {
    let wanted = super::exe_name(name);
    let mut level = vec![dir.to_path_buf()];
    for _ in 0..max_depth {
        let mut next = Vec::new();
        for current in &level {
            let Ok(entries) = fs::read_dir(current) else {
                continue;
            };
            let mut entries: Vec<_> = entries.filter_map(Result::ok).collect();
            entries.sort_by_key(fs::DirEntry::file_name);
            for entry in entries {
                let path = entry.path();
                match entry.file_type() {
                    Ok(t) if t.is_dir() => next.push(path),
                    Ok(_) if entry.file_name().as_os_str() == OsStr::new(&wanted) => return Some(path),
                    _ => {}
                }
            }
        }
        level = next;
    }
    None
}

/// Mark `path` executable (mode 0755). No-op off Unix.
pub(crate) fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
