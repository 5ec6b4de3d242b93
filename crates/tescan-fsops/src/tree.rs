//! Input-tree discovery and cleanup.
//!
//! # Design
//! - Discovery is one sorted pass so runs over the same tree dispatch in the same order.
//! - Cleanup walks bottom-up and never removes the root itself.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{FsOpsError, FsOpsResult};

/// Scheduling lane of a discovered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Processed in the bounded parallel lane.
    Ordinary,
    /// Processed one at a time in the archive lane.
    Archive,
}

/// A regular file found under the input root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Absolute path of the file.
    pub source_path: PathBuf,
    /// Path relative to the input root.
    pub relative_path: PathBuf,
    /// Lane the file is scheduled on.
    pub kind: FileKind,
}

/// Classify `path` as an archive when its extension (compared
/// case-insensitively, with leading dot) appears in `archive_extensions`.
#[must_use]
pub fn file_kind(path: &Path, archive_extensions: &[String]) -> FileKind {
    let is_archive = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .is_some_and(|dotted| archive_extensions.iter().any(|known| *known == dotted));
    if is_archive {
        FileKind::Archive
    } else {
        FileKind::Ordinary
    }
}

/// Walk `root` and return every regular file in lexical path order.
///
/// Symlinks are not followed; staging files left by an interrupted transfer
/// are skipped.
///
/// # Errors
///
/// Returns [`FsOpsError::Walkdir`] when the tree cannot be read.
pub fn discover(root: &Path, archive_extensions: &[String]) -> FsOpsResult<Vec<DiscoveredFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| FsOpsError::walkdir("discover.walk", root, source))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.') && name.ends_with(".tescan-partial"))
        {
            debug!(path = %entry.path().display(), "skipping partial transfer artifact");
            continue;
        }
        let relative_path = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| FsOpsError::InvalidInput {
                field: "source_path",
                reason: "outside the input root",
                value: Some(entry.path().display().to_string()),
            })?
            .to_path_buf();
        files.push(DiscoveredFile {
            kind: file_kind(entry.path(), archive_extensions),
            source_path: entry.path().to_path_buf(),
            relative_path,
        });
    }
    Ok(files)
}

/// Remove every empty directory below `root`, deepest first. `root` stays.
///
/// Returns the number of directories removed. A directory that gains an entry
/// between the walk and the removal is left alone.
///
/// # Errors
///
/// Returns [`FsOpsError::Walkdir`] when the tree cannot be read.
pub fn remove_empty_dirs(root: &Path) -> FsOpsResult<usize> {
    let mut removed = 0;
    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .contents_first(true)
    {
        let entry =
            entry.map_err(|source| FsOpsError::walkdir("remove_empty_dirs.walk", root, source))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        match fs::remove_dir(entry.path()) {
            Ok(()) => {
                debug!(path = %entry.path().display(), "removed empty directory");
                removed += 1;
            }
            Err(err) if is_not_empty(&err) => {}
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "failed to remove directory");
            }
        }
    }
    Ok(removed)
}

fn is_not_empty(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::AlreadyExists
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = anyhow::Result<()>;

    fn archives() -> Vec<String> {
        vec![".zip".to_string(), ".7z".to_string()]
    }

    #[test]
    fn discover_is_sorted_and_classifies_lanes() -> TestResult {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("b/nested"))?;
        fs::create_dir_all(root.join("a"))?;
        fs::write(root.join("b/nested/z.txt"), b"z")?;
        fs::write(root.join("a/bundle.ZIP"), b"pk")?;
        fs::write(root.join("a/notes.txt"), b"n")?;
        fs::write(root.join("a/.notes.txt.tescan-partial"), b"half")?;
        fs::write(root.join("top.7z"), b"7z")?;

        let found = discover(root, &archives())?;
        let relative: Vec<_> = found
            .iter()
            .map(|file| file.relative_path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            relative,
            vec!["a/bundle.ZIP", "a/notes.txt", "b/nested/z.txt", "top.7z"]
        );
        let kinds: Vec<_> = found.iter().map(|file| file.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FileKind::Archive,
                FileKind::Ordinary,
                FileKind::Ordinary,
                FileKind::Archive
            ]
        );
        assert!(found.iter().all(|file| file.source_path.is_absolute()));
        Ok(())
    }

    #[test]
    fn discover_missing_root_fails() {
        let err = discover(Path::new("/no/such/root"), &archives()).unwrap_err();
        assert!(matches!(err, FsOpsError::Walkdir { .. }));
    }

    #[test]
    fn remove_empty_dirs_keeps_root_and_populated_dirs() -> TestResult {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("a/b"))?;
        fs::create_dir_all(root.join("c/d/e"))?;
        fs::create_dir_all(root.join("keep"))?;
        fs::write(root.join("keep/file.txt"), b"x")?;

        let removed = remove_empty_dirs(root)?;
        assert_eq!(removed, 5);
        assert!(root.exists());
        assert!(!root.join("a").exists());
        assert!(!root.join("c").exists());
        assert!(root.join("keep/file.txt").exists());

        assert_eq!(remove_empty_dirs(root)?, 0);
        Ok(())
    }

    #[test]
    fn file_kind_is_case_insensitive() {
        assert_eq!(
            file_kind(Path::new("x/archive.Zip"), &archives()),
            FileKind::Archive
        );
        assert_eq!(
            file_kind(Path::new("x/README"), &archives()),
            FileKind::Ordinary
        );
    }
}
