//! Project root detection.

use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};

enum Marker {
    Name(String),
    Glob(GlobMatcher),
}

impl Marker {
    fn parse(pattern: &str) -> Self {
        if pattern.contains(['*', '?', '[']) {
            match Glob::new(pattern) {
                Ok(glob) => return Self::Glob(glob.compile_matcher()),
                Err(e) => {
                    tracing::debug!(%pattern, "Invalid root marker glob, matching literally: {e}");
                }
            }
        }
        Self::Name(pattern.to_string())
    }

    fn present_in(&self, dir: &Path) -> bool {
        match self {
            Self::Name(name) => dir.join(name).exists(),
            Self::Glob(matcher) => fs::read_dir(dir).is_ok_and(|entries| {
                entries
                    .filter_map(Result::ok)
                    .any(|entry| matcher.is_match(entry.file_name()))
            }),
        }
    }
}

/// Find the project root for `start`, walking up from the directory that
/// contains it.
///
/// The walk never examines the user's home directory or the filesystem root.
/// In each directory an exclude marker ends the search with `None`; otherwise
/// the first root marker present makes that directory the root.
pub fn find_project_root(
    start: &Path,
    root_patterns: &[String],
    exclude_patterns: &[String],
) -> Option<PathBuf> {
    let home = dirs::home_dir();
    find_project_root_within(start, root_patterns, exclude_patterns, home.as_deref())
}

/// [`find_project_root`] with an explicit stop directory in place of home.
pub fn find_project_root_within(
    start: &Path,
    root_patterns: &[String],
    exclude_patterns: &[String],
    stop_at: Option<&Path>,
) -> Option<PathBuf> {
    let roots: Vec<Marker> = root_patterns.iter().map(|p| Marker::parse(p)).collect();
    let excludes: Vec<Marker> = exclude_patterns.iter().map(|p| Marker::parse(p)).collect();

    let mut dir = if start.is_dir() { Some(start) } else { start.parent() };
    while let Some(current) = dir {
        let parent = current.parent();
        if parent.is_none() || stop_at == Some(current) {
            break;
        }
        if excludes.iter().any(|m| m.present_in(current)) {
            tracing::trace!(dir = %current.display(), "Exclude marker found, skipping server");
            return None;
        }
        if roots.iter().any(|m| m.present_in(current)) {
            return Some(current.to_path_buf());
        }
        dir = parent;
    }
    None
}
