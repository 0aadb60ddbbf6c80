//! Name-based folder diff.

use std::collections::BTreeSet;

/// Transfers needed to make two catalogs hold the same names.
///
/// Names present on both sides are treated as identical. No content or
/// timestamp comparison is made, so a modified file whose name did not change
/// is never transferred again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Remote names missing locally
    pub downloads: Vec<String>,
    /// Local names missing remotely
    pub uploads: Vec<String>,
}

impl SyncPlan {
    /// Compute the plan from the local and remote name sets.
    ///
    /// Both outputs are sorted and free of duplicates.
    #[must_use]
    pub fn compute<L, R>(local: L, remote: R) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let local: BTreeSet<String> = local.into_iter().map(Into::into).collect();
        let remote: BTreeSet<String> = remote.into_iter().map(Into::into).collect();

        Self {
            downloads: remote.difference(&local).cloned().collect(),
            uploads: local.difference(&remote).cloned().collect(),
        }
    }

    /// Total number of transfers.
    #[must_use]
    pub fn total_ops(&self) -> usize {
        self.downloads.len() + self.uploads.len()
    }

    /// Whether nothing needs to be transferred.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty() && self.uploads.is_empty()
    }
}
