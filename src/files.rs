//! File operations confined to a working clone.
//!
//! Callers pass the clone root from a verified [`OwnedRepository`]; every
//! client path goes through [`path_guard::validate`] before any I/O.
//!
//! [`OwnedRepository`]: crate::ownership::OwnedRepository

use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::path_guard::{self, relative_display};

/// Directory names never shown in listings.
pub const HIDDEN_DIRECTORIES: &[&str] = &["node_modules", ".git", ".next", "dist", "build", ".cache"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    /// Path relative to the clone root, forward slashes.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

/// Validate `relative` against `root`, logging refusals as security events.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    path_guard::validate(relative, root)
        .into_result()
        .map_err(|reason| {
            warn!(
                target: "security",
                root = %root.display(),
                path = relative,
                %reason,
                "Rejected client path"
            );
            SandboxError::PathRejected(reason)
        })
}

pub async fn read_bytes(root: &Path, relative: &str) -> Result<Vec<u8>> {
    let path = resolve(root, relative)?;
    ensure_cloned(root).await?;
    tokio::fs::read(&path)
        .await
        .map_err(|e| io_error(e, relative))
}

pub async fn read_text(root: &Path, relative: &str) -> Result<String> {
    let bytes = read_bytes(root, relative).await?;
    String::from_utf8(bytes).map_err(|_| {
        SandboxError::InvalidRequest(format!(
            "{} is not valid UTF-8; request it with base64 encoding",
            relative
        ))
    })
}

/// Overwrite (or create) a file, creating parent directories. Last writer wins.
pub async fn write_bytes(root: &Path, relative: &str, content: &[u8]) -> Result<()> {
    let path = resolve(root, relative)?;
    ensure_cloned(root).await?;
    if relative_display(root, &path).is_empty() {
        return Err(SandboxError::InvalidRequest("a file path is required".to_string()));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(e, relative))?;
    }
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| io_error(e, relative))?;
    debug!(path = relative, bytes = content.len(), "Wrote file");
    Ok(())
}

/// Remove a single file. Directories are refused.
pub async fn delete(root: &Path, relative: &str) -> Result<()> {
    let path = resolve(root, relative)?;
    ensure_cloned(root).await?;
    let metadata = tokio::fs::symlink_metadata(&path)
        .await
        .map_err(|e| io_error(e, relative))?;
    if metadata.is_dir() {
        return Err(SandboxError::InvalidRequest(format!(
            "{} is a directory; only files can be deleted",
            relative
        )));
    }
    tokio::fs::remove_file(&path)
        .await
        .map_err(|e| io_error(e, relative))?;
    debug!(path = relative, "Deleted file");
    Ok(())
}

/// Entries of `directory`, minus dotfiles and build/VCS directories.
/// Directories sort before files, then by name.
pub async fn list(root: &Path, directory: &str) -> Result<Vec<DirEntry>> {
    let path = resolve(root, directory)?;
    ensure_cloned(root).await?;
    let base = relative_display(root, &path);
    let mut reader = tokio::fs::read_dir(&path)
        .await
        .map_err(|e| io_error(e, directory))?;

    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let kind = if entry.file_type().await?.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        if kind == EntryKind::Directory && HIDDEN_DIRECTORIES.contains(&name.as_str()) {
            continue;
        }
        entries.push(DirEntry {
            path: if base.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", base, name)
            },
            name,
            kind,
        });
    }

    entries.sort_by(|a, b| {
        let rank = |e: &DirEntry| if e.kind == EntryKind::Directory { 0 } else { 1 };
        rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name))
    });
    Ok(entries)
}

/// The clone root must exist; a missing root means "not cloned yet".
pub async fn ensure_cloned(root: &Path) -> Result<()> {
    match tokio::fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SandboxError::RepositoryNotCloned),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(SandboxError::RepositoryNotCloned),
        Err(e) => Err(SandboxError::Io(e)),
    }
}

fn io_error(e: std::io::Error, relative: &str) -> SandboxError {
    match e.kind() {
        ErrorKind::NotFound => SandboxError::NotFound(relative.to_string()),
        _ => SandboxError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_guard::PathRejection;

    fn clone_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("README.md"), "# widgets\n").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn reads_text_inside_root() {
        let dir = clone_dir();
        assert_eq!(read_text(dir.path(), "README.md").await.unwrap(), "# widgets\n");
    }

    #[tokio::test]
    async fn write_creates_parents_and_overwrites() {
        let dir = clone_dir();
        write_bytes(dir.path(), "a/b/c.txt", b"one").await.unwrap();
        write_bytes(dir.path(), "a/b/c.txt", b"two").await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a/b/c.txt")).unwrap(), "two");
    }

    #[tokio::test]
    async fn write_to_root_itself_is_refused() {
        let dir = clone_dir();
        let err = write_bytes(dir.path(), "", b"x").await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_io() {
        let dir = clone_dir();
        let err = write_bytes(dir.path(), "../escape.txt", b"x").await.unwrap_err();
        assert!(matches!(err, SandboxError::PathRejected(PathRejection::Traversal)));
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = clone_dir();
        let err = read_text(dir.path(), "nope.txt").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(p) if p == "nope.txt"));
    }

    #[tokio::test]
    async fn missing_root_is_not_cloned() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("never-cloned");
        for err in [
            read_text(&root, "README.md").await.unwrap_err(),
            write_bytes(&root, "x.txt", b"x").await.unwrap_err(),
            delete(&root, "x.txt").await.unwrap_err(),
            list(&root, "").await.unwrap_err(),
        ] {
            assert!(matches!(err, SandboxError::RepositoryNotCloned));
        }
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn invalid_utf8_asks_for_base64() {
        let dir = clone_dir();
        std::fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(
            read_text(dir.path(), "blob.bin").await.unwrap_err(),
            SandboxError::InvalidRequest(_)
        ));
        assert_eq!(read_bytes(dir.path(), "blob.bin").await.unwrap(), vec![0xff, 0xfe, 0x00]);
    }

    #[tokio::test]
    async fn delete_removes_files_but_not_directories() {
        let dir = clone_dir();
        delete(dir.path(), "README.md").await.unwrap();
        assert!(!dir.path().join("README.md").exists());

        let err = delete(dir.path(), "src").await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
        assert!(dir.path().join("src/lib.rs").exists());
    }

    #[tokio::test]
    async fn list_hides_dotfiles_and_build_dirs() {
        let dir = clone_dir();
        for hidden in ["node_modules", ".git", "dist", "build", ".cache", ".next"] {
            std::fs::create_dir_all(dir.path().join(hidden)).unwrap();
        }
        std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();

        let entries = list(dir.path(), "").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["src", "README.md"]);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[1].path, "README.md");
    }

    #[tokio::test]
    async fn list_paths_are_relative_to_root() {
        let dir = clone_dir();
        let entries = list(dir.path(), "src").await.unwrap();
        assert_eq!(
            entries,
            vec![DirEntry {
                name: "lib.rs".to_string(),
                path: "src/lib.rs".to_string(),
                kind: EntryKind::File,
            }]
        );
    }
}
