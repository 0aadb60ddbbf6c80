//! Storage provider boundary and the local filesystem implementation.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

/// Readable byte stream handed out by a storage provider.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable byte stream handed out by a storage provider.
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opaque reference to an entry inside a storage root.
///
/// Handles are `/`-separated paths relative to the root; the root itself is
/// the empty handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntryHandle(String);

impl EntryHandle {
    /// The handle of the storage root.
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Build a handle from a relative path, normalizing `\` to `/`.
    #[must_use]
    pub fn new(relative: &str) -> Self {
        Self(relative.replace('\\', "/").trim_matches('/').to_string())
    }

    /// Handle of a direct child of this entry.
    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        if self.0.is_empty() {
            Self::new(name)
        } else {
            Self::new(&format!("{}/{name}", self.0))
        }
    }

    /// The relative path this handle refers to.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the root handle.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One child returned by [`StorageProvider::enumerate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    /// Entry name (last path component)
    pub name: String,
    /// Size in bytes, 0 for directories
    pub size: u64,
    /// Whether the entry is a directory
    pub is_directory: bool,
    /// Handle for further operations
    pub handle: EntryHandle,
}

/// Hierarchical storage backing a shared folder.
///
/// Implementations only need to enumerate one directory level at a time; the
/// catalog performs the recursive walk.
#[async_trait]
pub trait StorageProvider: Send + Sync + fmt::Debug {
    /// Handle of the shared root.
    fn root(&self) -> EntryHandle {
        EntryHandle::root()
    }

    /// List the direct children of a directory.
    async fn enumerate(&self, dir: &EntryHandle) -> Result<Vec<StorageEntry>>;

    /// Open an entry for reading.
    async fn open_read(&self, handle: &EntryHandle) -> Result<ByteReader>;

    /// Create (or truncate) a file directly under the root.
    async fn create_entry(&self, name: &str) -> Result<EntryHandle>;

    /// Open an existing entry for writing from the start.
    async fn open_write(&self, handle: &EntryHandle) -> Result<ByteWriter>;

    /// Rename an entry to `name` under the root, replacing any existing file.
    async fn rename(&self, handle: &EntryHandle, name: &str) -> Result<EntryHandle>;

    /// Delete an entry.
    async fn remove(&self, handle: &EntryHandle) -> Result<()>;
}

/// Filesystem-backed storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Use `root` as the shared folder, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        if !root.is_dir() {
            return Err(Error::InvalidPath(root.display().to_string()));
        }
        Ok(Self { root })
    }

    /// The directory backing this storage.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, handle: &EntryHandle) -> Result<PathBuf> {
        if handle.is_root() {
            return Ok(self.root.clone());
        }
        sanitize_path(&self.root, Path::new(handle.as_str()))
            .ok_or_else(|| Error::InvalidPath(handle.to_string()))
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    async fn enumerate(&self, dir: &EntryHandle) -> Result<Vec<StorageEntry>> {
        let path = self.resolve(dir)?;
        let parent = dir.clone();

        tokio::task::spawn_blocking(move || enumerate_dir(&path, &parent))
            .await
            .map_err(|e| Error::Internal(format!("enumeration task failed: {e}")))?
    }

    async fn open_read(&self, handle: &EntryHandle) -> Result<ByteReader> {
        let path = self.resolve(handle)?;
        let file = tokio::fs::File::open(&path).await?;
        Ok(Box::new(file))
    }

    async fn create_entry(&self, name: &str) -> Result<EntryHandle> {
        let handle = EntryHandle::root().join(name);
        let path = self.resolve(&handle)?;
        tokio::fs::File::create(&path).await?;
        Ok(handle)
    }

    async fn open_write(&self, handle: &EntryHandle) -> Result<ByteWriter> {
        let path = self.resolve(handle)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Box::new(file))
    }

    async fn rename(&self, handle: &EntryHandle, name: &str) -> Result<EntryHandle> {
        let from = self.resolve(handle)?;
        let target = EntryHandle::root().join(name);
        let to = self.resolve(&target)?;
        tokio::fs::rename(&from, &to).await?;
        Ok(target)
    }

    async fn remove(&self, handle: &EntryHandle) -> Result<()> {
        let path = self.resolve(handle)?;
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }
}

fn enumerate_dir(path: &Path, parent: &EntryHandle) -> Result<Vec<StorageEntry>> {
    if !path.is_dir() {
        return Err(Error::InvalidPath(parent.to_string()));
    }

    let walker = walkdir::WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .map_or_else(|| Error::InvalidPath(parent.to_string()), Error::Io)
        })?;

        if entry.file_type().is_symlink() {
            continue;
        }

        let Some(name) = entry.file_name().to_str() else {
            tracing::debug!(path = %entry.path().display(), "Skipping non UTF-8 file name");
            continue;
        };

        // Entries removed between listing and stat are skipped
        let Ok(metadata) = entry.metadata() else {
            continue;
        };

        let is_directory = metadata.is_dir();
        entries.push(StorageEntry {
            name: name.to_string(),
            size: if is_directory { 0 } else { metadata.len() },
            is_directory,
            handle: parent.join(name),
        });
    }

    Ok(entries)
}

/// Sanitize a relative path to prevent directory traversal attacks.
///
/// Returns the absolute path under `base`, or `None` if `relative` escapes it.
#[must_use]
pub fn sanitize_path(base: &Path, relative: &Path) -> Option<PathBuf> {
    for component in relative.components() {
        match component {
            std::path::Component::Normal(_) | std::path::Component::CurDir => {}
            _ => return None,
        }
    }

    let full_path = base.join(relative);

    if full_path.starts_with(base) {
        Some(full_path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_handle_join_and_normalize() {
        let root = EntryHandle::root();
        assert!(root.is_root());
        let sub = root.join("docs");
        assert_eq!(sub.as_str(), "docs");
        assert_eq!(sub.join("a.txt").as_str(), "docs/a.txt");
        assert_eq!(EntryHandle::new("docs\\b.txt").as_str(), "docs/b.txt");
    }

    #[test]
    fn test_sanitize_path_valid() {
        let base = Path::new("/home/user/shared");
        assert_eq!(
            sanitize_path(base, Path::new("sub/file.txt")),
            Some(PathBuf::from("/home/user/shared/sub/file.txt"))
        );
    }

    #[test]
    fn test_sanitize_path_traversal_attack() {
        let base = Path::new("/home/user/shared");
        assert_eq!(sanitize_path(base, Path::new("../../../etc/passwd")), None);
        assert_eq!(sanitize_path(base, Path::new("/etc/passwd")), None);
    }

    #[tokio::test]
    async fn test_enumerate_one_level_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c.txt"), b"ccc").unwrap();

        let storage = LocalStorage::new(dir.path()).unwrap();
        let entries = storage.enumerate(&EntryHandle::root()).await.unwrap();

        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(entries[1].size, 2);
        assert!(entries[2].is_directory);

        let nested = storage.enumerate(&entries[2].handle).await.unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].handle.as_str(), "sub/c.txt");
    }

    #[tokio::test]
    async fn test_escaping_handle_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let result = storage.open_read(&EntryHandle::new("../secret")).await;
        assert!(matches!(result, Err(Error::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_rename_replaces_existing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("target.txt"), b"old").unwrap();
        std::fs::write(dir.path().join("staged"), b"new").unwrap();

        let storage = LocalStorage::new(dir.path()).unwrap();
        let handle = storage
            .rename(&EntryHandle::new("staged"), "target.txt")
            .await
            .unwrap();

        assert_eq!(handle.as_str(), "target.txt");
        assert_eq!(std::fs::read(dir.path().join("target.txt")).unwrap(), b"new");
        assert!(!dir.path().join("staged").exists());
    }
}
