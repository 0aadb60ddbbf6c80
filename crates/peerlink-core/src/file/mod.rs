//! File operations for PeerLink.
//!
//! This module handles:
//! - Enumerating the shared folder through a [`StorageProvider`]
//! - Looking files up by name
//! - Scoped read streams and atomic write streams
//! - File name validation
//!
//! ## Atomic Writes
//!
//! [`FileCatalog::open_write`] stages incoming bytes under a hidden name in
//! the root. The file only appears under its real name once
//! [`PendingWrite::commit`] succeeds; a discarded or dropped write removes
//! the staged entry. Staged entries never show up in listings.
//!
//! ## Duplicate Names
//!
//! Listings flatten subdirectories, so two files with the same name in
//! different directories both appear. [`FileCatalog::get_file`] returns the
//! first one in walk order.

mod storage;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub use storage::{
    sanitize_path, ByteReader, ByteWriter, EntryHandle, LocalStorage, StorageEntry,
    StorageProvider,
};

/// Prefix of staging entries created by [`FileCatalog::open_write`].
pub const STAGING_PREFIX: &str = ".peerlink-partial-";

/// A file in a catalog listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File name (last path component)
    pub name: String,
    /// Storage handle
    pub handle: EntryHandle,
    /// Size in bytes
    pub size: u64,
    /// Always false for listed entries; directories are traversed, not listed
    pub is_directory: bool,
}

impl From<StorageEntry> for FileEntry {
    fn from(entry: StorageEntry) -> Self {
        Self {
            name: entry.name,
            handle: entry.handle,
            size: entry.size,
            is_directory: entry.is_directory,
        }
    }
}

/// Check that `name` can be stored as a file directly under a catalog root.
pub fn validate_file_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name == "." || name == ".." {
        Some("name is a relative path component")
    } else if name.contains(['/', '\\', '\0']) {
        Some("name contains a path separator or NUL")
    } else if name.starts_with(STAGING_PREFIX) {
        Some("name uses the reserved staging prefix")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::InvalidFileName(format!("'{name}': {reason}"))),
        None => Ok(()),
    }
}

fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX)
}

/// The shared folder as seen by the transfer protocol and the sync coordinator.
///
/// Listings are computed fresh on every call; nothing is cached.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    storage: Arc<dyn StorageProvider>,
}

impl FileCatalog {
    /// Create a catalog over a storage provider.
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self { storage }
    }

    /// Create a catalog over a local directory.
    pub fn local(root: impl Into<std::path::PathBuf>) -> Result<Self> {
        Ok(Self::new(Arc::new(LocalStorage::new(root)?)))
    }

    /// The backing storage provider.
    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    /// List every file under the root (`recursive`) or only its direct children.
    pub async fn list_files(&self, recursive: bool) -> Result<Vec<FileEntry>> {
        let mut files = Vec::new();
        self.walk(self.storage.root(), recursive, &mut files).await?;
        Ok(files)
    }

    /// Names of every file in the recursive listing.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        Ok(self
            .list_files(true)
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    /// First file in the recursive listing named `name`.
    pub async fn get_file(&self, name: &str) -> Result<Option<FileEntry>> {
        Ok(self
            .list_files(true)
            .await?
            .into_iter()
            .find(|entry| entry.name == name))
    }

    /// Open a listed file for reading.
    pub async fn open_read(&self, entry: &FileEntry) -> Result<ByteReader> {
        if entry.is_directory {
            return Err(Error::InvalidPath(entry.handle.to_string()));
        }
        self.storage.open_read(&entry.handle).await
    }

    /// Start an atomic write of `name` in the root.
    pub async fn open_write(&self, name: &str) -> Result<PendingWrite> {
        validate_file_name(name)?;

        let staging_name = format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let handle = self.storage.create_entry(&staging_name).await?;
        let writer = match self.storage.open_write(&handle).await {
            Ok(writer) => writer,
            Err(e) => {
                let _ = self.storage.remove(&handle).await;
                return Err(e);
            }
        };

        Ok(PendingWrite {
            storage: self.storage.clone(),
            name: name.to_string(),
            staging: Some(handle),
            writer: Some(writer),
            written: 0,
        })
    }

    fn walk<'a>(
        &'a self,
        dir: EntryHandle,
        recursive: bool,
        out: &'a mut Vec<FileEntry>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            for entry in self.storage.enumerate(&dir).await? {
                if entry.is_directory {
                    if recursive {
                        self.walk(entry.handle, recursive, out).await?;
                    }
                } else if !is_staging_name(&entry.name) {
                    out.push(entry.into());
                }
            }
            Ok(())
        }
        .boxed()
    }
}

/// A write in progress that becomes visible only on [`commit`](Self::commit).
///
/// Dropping an uncommitted write removes the staged bytes.
pub struct PendingWrite {
    storage: Arc<dyn StorageProvider>,
    name: String,
    staging: Option<EntryHandle>,
    writer: Option<ByteWriter>,
    written: u64,
}

impl std::fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWrite")
            .field("name", &self.name)
            .field("staging", &self.staging)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl PendingWrite {
    /// Final name of the file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes written so far.
    pub const fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Flush and publish the file under its final name.
    pub async fn commit(mut self) -> Result<FileEntry> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }

        let staging = self
            .staging
            .clone()
            .ok_or_else(|| Error::Internal("pending write already finished".to_string()))?;
        let handle = self.storage.rename(&staging, &self.name).await?;
        self.staging = None;

        Ok(FileEntry {
            name: self.name.clone(),
            handle,
            size: self.written,
            is_directory: false,
        })
    }

    /// Abandon the write and remove the staged bytes.
    pub async fn discard(mut self) -> Result<()> {
        self.writer = None;
        if let Some(staging) = self.staging.take() {
            self.storage.remove(&staging).await?;
        }
        Ok(())
    }
}

impl AsyncWrite for PendingWrite {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(writer) = this.writer.as_mut() else {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        };
        let poll = Pin::new(writer).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.written += *n as u64;
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.writer = None;
        let Some(staging) = self.staging.take() else {
            return;
        };

        let storage = self.storage.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = storage.remove(&staging).await {
                        tracing::warn!("Failed to remove staged entry {}: {}", staging, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("No runtime to remove staged entry {}", staging);
            }
        }
    }
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
