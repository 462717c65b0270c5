//! Find report bundles under a root directory.

use crate::error::IngestError;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "summary.json";
pub const FRAGMENT_FILE: &str = "_containerResult.json";
pub const ERROR_MARKER: &str = "_error.txt";

/// One report on disk: a manifest, its fragments and the two sidecars.
///
/// Sidecar paths are where the files are expected; they may not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub manifest_path: PathBuf,
    pub fragment_paths: Vec<PathBuf>,
    pub keylog_path: PathBuf,
    pub pcap_path: PathBuf,
}

/// Walk `root` and return every bundle, ordered by path.
///
/// A file root walks its parent directory. Only an unreadable root is an
/// error; unreadable entries below it are logged and skipped.
pub fn discover(
    root: &Path,
    keylog_name: &str,
    pcap_name: &str,
) -> Result<Vec<Bundle>, IngestError> {
    let metadata = std::fs::metadata(root).map_err(|e| IngestError::Discovery {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })?;
    let root = if metadata.is_dir() {
        root.to_path_buf()
    } else {
        root.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    };
    std::fs::read_dir(&root).map_err(|e| IngestError::Discovery {
        path: root.clone(),
        reason: e.to_string(),
    })?;

    let mut bundles = Vec::new();
    for manifest_path in walk_named(&root, MANIFEST_FILE) {
        let dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.clone());

        let mut fragment_paths = Vec::new();
        for entry in walk(&dir) {
            match entry.file_name().to_str() {
                Some(FRAGMENT_FILE) => fragment_paths.push(entry.into_path()),
                Some(ERROR_MARKER) => {
                    tracing::warn!(path = %entry.path().display(), "There were some errors");
                }
                _ => {}
            }
        }

        tracing::debug!(
            manifest = %manifest_path.display(),
            fragments = fragment_paths.len(),
            "found report"
        );
        bundles.push(Bundle {
            keylog_path: dir.join(keylog_name),
            pcap_path: dir.join(pcap_name),
            manifest_path,
            fragment_paths,
        });
    }
    Ok(bundles)
}

fn walk(dir: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(entry),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                None
            }
        })
}

fn walk_named(dir: &Path, name: &'static str) -> impl Iterator<Item = PathBuf> {
    walk(dir)
        .filter(move |entry| entry.file_name() == name)
        .map(walkdir::DirEntry::into_path)
}
