//! Local tree scanning.
//!
//! Walks a directory and produces file entries with relative paths
//! normalized to forward slashes, so they line up with remote keys.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::exclude::ExcludeSet;

/// Suffix of in-flight download staging files; never synced.
const STAGING_SUFFIX: &str = ".volsync-part";

/// A regular file found under the sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Path relative to the root, `/`-separated.
    pub relative_path: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Scans `root` recursively, skipping excluded paths.
///
/// Excluded directories are pruned without being descended into. Symlinks
/// are not followed. The result is sorted by relative path.
pub fn scan_local(root: &Path, excludes: &ExcludeSet) -> Result<Vec<LocalFile>, SyncError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || relative_of(root, entry.path())
                    .is_none_or(|rel| !excludes.is_excluded(&rel))
        });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative_path) = relative_of(root, entry.path()) else {
            warn!(path = %entry.path().display(), "skipping file with non UTF-8 name");
            continue;
        };
        if relative_path.ends_with(STAGING_SUFFIX) {
            continue;
        }
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        files.push(LocalFile {
            relative_path,
            path: entry.path().to_path_buf(),
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn relative_of(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        fs::write(root.join("photo.jpg"), b"JPEG_DATA").unwrap();
        fs::write(root.join("notes.txt"), b"NOTE").unwrap();

        fs::create_dir_all(root.join("docs").join("drafts")).unwrap();
        fs::write(root.join("docs").join("plan.md"), b"PLAN").unwrap();
        fs::write(
            root.join("docs").join("drafts").join("v1.md"),
            b"FIRST_DRAFT",
        )
        .unwrap();

        fs::create_dir_all(root.join(".git").join("objects")).unwrap();
        fs::write(root.join(".git").join("HEAD"), b"ref").unwrap();
        fs::write(root.join(".git").join("objects").join("ab"), b"blob").unwrap();

        dir
    }

    fn paths(files: &[LocalFile]) -> Vec<&str> {
        files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn scan_lists_every_file_sorted() {
        let dir = create_test_tree();
        let files = scan_local(dir.path(), &ExcludeSet::default()).unwrap();
        assert_eq!(
            paths(&files),
            vec![
                ".git/HEAD",
                ".git/objects/ab",
                "docs/drafts/v1.md",
                "docs/plan.md",
                "notes.txt",
                "photo.jpg",
            ]
        );
        let draft = files.iter().find(|f| f.relative_path == "docs/drafts/v1.md").unwrap();
        assert_eq!(draft.size, 11);
        assert!(draft.path.ends_with("v1.md"));
    }

    #[test]
    fn excluded_directories_are_pruned() {
        let dir = create_test_tree();
        let excludes = ExcludeSet::new(&[".git", "*.txt"]).unwrap();
        let files = scan_local(dir.path(), &excludes).unwrap();
        assert_eq!(
            paths(&files),
            vec!["docs/drafts/v1.md", "docs/plan.md", "photo.jpg"]
        );
    }

    #[test]
    fn staging_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("big.iso"), b"done").unwrap();
        fs::write(dir.path().join("next.iso.volsync-part"), b"half").unwrap();
        let files = scan_local(dir.path(), &ExcludeSet::default()).unwrap();
        assert_eq!(paths(&files), vec!["big.iso"]);
    }

    #[test]
    fn empty_directory_yields_nothing() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a").join("b")).unwrap();
        assert!(scan_local(dir.path(), &ExcludeSet::default()).unwrap().is_empty());
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = scan_local(&dir.path().join("nope"), &ExcludeSet::default());
        assert!(matches!(result, Err(SyncError::Io(_))));
    }
}
