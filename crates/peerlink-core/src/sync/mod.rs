//! Folder synchronization by name diff.
//!
//! A sync run reconciles the local catalog with the connected peer's catalog:
//!
//! 1. List local names and fetch the remote listing (`GET_FILE_LIST`)
//! 2. Download every remote name missing locally and upload every local name
//!    missing remotely
//! 3. Refresh the remote listing
//!
//! Transfers are best effort. A failed item is recorded in the
//! [`SyncReport`] and the rest of the batch still runs. Every download goes
//! through the catalog's atomic write, so a failed item never leaves a
//! partial file behind.
//!
//! ## Example
//!
//! ```rust,ignore
//! use peerlink_core::sync::SyncCoordinator;
//!
//! let coordinator = SyncCoordinator::new(catalog, client, config.sync);
//! let report = coordinator.sync().await?;
//! println!("{} down, {} up", report.downloaded.len(), report.uploaded.len());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

mod plan;

pub use plan::SyncPlan;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::file::{FileCatalog, FileEntry};
use crate::transfer::TransferClient;

/// Direction of one sync transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Remote to local
    Download,
    /// Local to remote
    Upload,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => write!(f, "download"),
            Self::Upload => write!(f, "upload"),
        }
    }
}

/// One transfer that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    /// File name
    pub file: String,
    /// Transfer direction
    pub direction: SyncDirection,
    /// Error text
    pub error: String,
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Names stored locally by this run
    pub downloaded: Vec<String>,
    /// Names sent to the peer by this run
    pub uploaded: Vec<String>,
    /// Transfers that failed
    pub failures: Vec<SyncFailure>,
    /// Remote listing after the batch; `None` if the refresh failed
    pub remote_files: Option<Vec<String>>,
}

impl SyncReport {
    /// Whether every planned transfer succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of transfers performed.
    pub fn transferred(&self) -> usize {
        self.downloaded.len() + self.uploaded.len()
    }
}

struct Job {
    name: String,
    direction: SyncDirection,
    entry: Option<FileEntry>,
}

/// Drives diff-based transfer batches against one connected peer.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    catalog: Arc<FileCatalog>,
    client: TransferClient,
    config: SyncConfig,
}

impl SyncCoordinator {
    /// Create a coordinator for `catalog` and a client pointed at the peer.
    pub fn new(catalog: Arc<FileCatalog>, client: TransferClient, config: SyncConfig) -> Self {
        Self {
            catalog,
            client,
            config,
        }
    }

    /// The local catalog.
    pub fn catalog(&self) -> &Arc<FileCatalog> {
        &self.catalog
    }

    /// Fetch the remote listing.
    pub async fn refresh_remote(&self) -> Result<Vec<String>> {
        self.client.list_files().await
    }

    /// Compute the plan without transferring anything.
    pub async fn plan(&self) -> Result<SyncPlan> {
        let local = self.catalog.list_files(self.config.recursive).await?;
        let remote = self.refresh_remote().await?;
        Ok(SyncPlan::compute(local.into_iter().map(|e| e.name), remote))
    }

    /// Run one sync.
    ///
    /// Fails only if the local catalog or the initial remote listing cannot
    /// be read. Individual transfer failures are reported in the result.
    pub async fn sync(&self) -> Result<SyncReport> {
        let local = self.catalog.list_files(self.config.recursive).await?;
        let remote = self.refresh_remote().await?;

        // First entry wins for duplicate names in different directories
        let mut local_entries: HashMap<String, FileEntry> = HashMap::new();
        for entry in local {
            local_entries.entry(entry.name.clone()).or_insert(entry);
        }

        let plan = SyncPlan::compute(local_entries.keys().cloned(), remote);
        tracing::info!(
            downloads = plan.downloads.len(),
            uploads = plan.uploads.len(),
            peer = %self.client.addr(),
            "Sync plan computed"
        );

        let mut jobs: Vec<Job> = plan
            .downloads
            .into_iter()
            .map(|name| Job {
                name,
                direction: SyncDirection::Download,
                entry: None,
            })
            .collect();
        jobs.extend(plan.uploads.into_iter().map(|name| {
            let entry = local_entries.remove(&name);
            Job {
                name,
                direction: SyncDirection::Upload,
                entry,
            }
        }));

        let parallel = self.config.parallel_transfers.max(1);
        let outcomes: Vec<(Job, Result<()>)> = stream::iter(jobs)
            .map(|job| async move {
                let result = self.run_job(&job).await;
                (job, result)
            })
            .buffer_unordered(parallel)
            .collect()
            .await;

        let mut report = SyncReport::default();
        for (job, result) in outcomes {
            match result {
                Ok(()) => match job.direction {
                    SyncDirection::Download => report.downloaded.push(job.name),
                    SyncDirection::Upload => report.uploaded.push(job.name),
                },
                Err(e) => {
                    tracing::warn!("Sync {} of {} failed: {}", job.direction, job.name, e);
                    report.failures.push(SyncFailure {
                        file: job.name,
                        direction: job.direction,
                        error: e.to_string(),
                    });
                }
            }
        }
        report.downloaded.sort();
        report.uploaded.sort();

        report.remote_files = match self.refresh_remote().await {
            Ok(names) => Some(names),
            Err(e) => {
                tracing::warn!("Refreshing remote listing after sync failed: {}", e);
                None
            }
        };

        tracing::info!(
            downloaded = report.downloaded.len(),
            uploaded = report.uploaded.len(),
            failed = report.failures.len(),
            "Sync finished"
        );
        Ok(report)
    }

    async fn run_job(&self, job: &Job) -> Result<()> {
        match job.direction {
            SyncDirection::Download => {
                self.client.download(&job.name, &self.catalog).await?;
            }
            SyncDirection::Upload => {
                let entry = job
                    .entry
                    .as_ref()
                    .ok_or_else(|| Error::FileNotFound(job.name.clone()))?;
                self.client.upload(entry, &self.catalog).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let report = SyncReport {
            downloaded: vec!["a".into()],
            uploaded: vec!["b".into(), "c".into()],
            failures: vec![],
            remote_files: None,
        };
        assert!(report.is_complete());
        assert_eq!(report.transferred(), 3);
    }

    #[test]
    fn test_failure_serializes_direction() {
        let failure = SyncFailure {
            file: "x.bin".into(),
            direction: SyncDirection::Upload,
            error: "connection closed".into(),
        };
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"upload\""));
    }
}
