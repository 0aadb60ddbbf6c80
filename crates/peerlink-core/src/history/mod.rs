//! Transfer history tracking for PeerLink.
//!
//! The transfer client and server report every completed file transfer to an
//! optional [`TransferLogSink`]. Durable storage belongs to the host; this
//! module only ships a bounded in-memory [`TransferHistory`].

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::HistoryConfig;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// File was sent to the peer
    Sent,
    /// File was received from the peer
    Received,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Received => write!(f, "received"),
        }
    }
}

/// One completed file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Unique identifier for this record
    pub id: Uuid,
    /// Name of the transferred file
    pub file_name: String,
    /// Direction of the transfer
    pub direction: TransferDirection,
    /// Completion time
    pub timestamp: DateTime<Utc>,
    /// Number of bytes transferred
    pub size: u64,
}

impl TransferRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(file_name: impl Into<String>, direction: TransferDirection, size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            direction,
            timestamp: Utc::now(),
            size,
        }
    }
}

/// Receiver of completed-transfer records.
pub trait TransferLogSink: Send + Sync + std::fmt::Debug {
    /// Record a completed transfer. Must not block.
    fn record(&self, record: TransferRecord);
}

/// Bounded in-memory transfer log; the oldest entries are evicted first.
#[derive(Debug)]
pub struct TransferHistory {
    entries: Mutex<VecDeque<TransferRecord>>,
    max_entries: usize,
}

impl TransferHistory {
    /// Create a history bounded by `config.max_entries`.
    #[must_use]
    pub fn new(config: &HistoryConfig) -> Self {
        Self::with_capacity(config.max_entries)
    }

    /// Create a history holding at most `max_entries` records.
    #[must_use]
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries,
        }
    }

    /// Snapshot of the entries, newest first.
    pub fn entries(&self) -> Vec<TransferRecord> {
        self.lock().iter().rev().cloned().collect()
    }

    /// Entries in one direction, newest first.
    pub fn filter_by_direction(&self, direction: TransferDirection) -> Vec<TransferRecord> {
        self.lock()
            .iter()
            .rev()
            .filter(|r| r.direction == direction)
            .cloned()
            .collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TransferRecord>> {
        // A poisoned log is still a valid log
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TransferLogSink for TransferHistory {
    fn record(&self, record: TransferRecord) {
        if self.max_entries == 0 {
            return;
        }
        tracing::debug!(
            file = %record.file_name,
            direction = %record.direction,
            "Recording transfer"
        );
        let mut entries = self.lock();
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(record);
    }
}
