//! Diagnostics store: per-file diagnostics as last published by one server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::types::{Diagnostic, DiagnosticsSnapshot};

/// Latest diagnostics per file for a single client.
///
/// An empty list is kept: it records that the server has analyzed the file
/// and found nothing, which differs from not having reported at all.
#[derive(Debug, Default)]
pub(crate) struct DiagnosticsStore {
    data: HashMap<PathBuf, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the diagnostics for `path`.
    pub fn update(&mut self, path: PathBuf, items: Vec<Diagnostic>) {
        self.data.insert(path, items);
    }

    pub fn remove(&mut self, path: &Path) {
        self.data.remove(path);
    }

    pub fn get(&self, path: &Path) -> Option<&[Diagnostic]> {
        self.data.get(path).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &Vec<Diagnostic>)> {
        self.data.iter()
    }
}

/// Build a host-facing snapshot from merged per-file diagnostics.
///
/// Files without diagnostics are dropped. Files with errors sort first,
/// then alphabetically.
pub(crate) fn snapshot(merged: HashMap<PathBuf, Vec<Diagnostic>>) -> DiagnosticsSnapshot {
    let mut files: Vec<(PathBuf, Vec<Diagnostic>)> = merged
        .into_iter()
        .filter(|(_, items)| !items.is_empty())
        .collect();

    files.sort_by(|a, b| {
        let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
        let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
        b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
    });

    DiagnosticsSnapshot::new(files)
}
