//! Version marker handling and inspection of the cache directory.

use std::fs;
use std::io;
use std::path::Path;

use crate::types::CacheInfo;

pub(crate) const VERSION_FILE: &str = "version";

/// Make sure the cache at `root` is marked with `version`.
///
/// When the marker is missing or differs, every entry except the marker is
/// deleted and the marker is rewritten. Returns whether a wipe happened.
pub(crate) async fn ensure_version(root: &Path, version: &str) -> io::Result<bool> {
    tokio::fs::create_dir_all(root).await?;
    let marker = root.join(VERSION_FILE);
    match tokio::fs::read_to_string(&marker).await {
        Ok(current) if current.trim() == version => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    wipe(root, version).await?;
    Ok(true)
}

pub(crate) async fn wipe(root: &Path, version: &str) -> io::Result<()> {
    tokio::fs::create_dir_all(root).await?;
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() == VERSION_FILE {
            continue;
        }
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    tokio::fs::write(root.join(VERSION_FILE), version).await
}

pub(crate) fn info(root: &Path) -> CacheInfo {
    let version = fs::read_to_string(root.join(VERSION_FILE))
        .ok()
        .map(|v| v.trim().to_string());

    let mut binaries: Vec<String> = fs::read_dir(root.join("bin"))
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    binaries.sort();

    CacheInfo {
        path: root.to_path_buf(),
        version,
        binaries,
        has_packages: root.join("packages").join("node_modules").is_dir(),
        size_bytes: dir_size(root),
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| match entry.file_type() {
            Ok(t) if t.is_dir() => dir_size(&entry.path()),
            Ok(t) if t.is_file() => entry.metadata().map_or(0, |m| m.len()),
            _ => 0,
        })
        .sum()
}
