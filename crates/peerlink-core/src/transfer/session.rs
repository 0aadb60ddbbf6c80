//! Per-operation transfer sessions and progress reporting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::file::format_size;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Logical operation carried by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirection {
    /// File listing
    List,
    /// File bytes flowing from server to client
    Download,
    /// File bytes flowing from client to server
    Upload,
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Command and reply are being exchanged
    Handshaking,
    /// File bytes are flowing
    Transmitting,
    /// Operation finished successfully
    Completed,
    /// Operation failed
    Failed,
}

/// Progress snapshot of one session.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Session identifier
    pub session_id: Uuid,
    /// Operation
    pub direction: SessionDirection,
    /// Current state
    pub state: SessionState,
    /// File being transferred, empty for listings
    pub file_name: String,
    /// Bytes transferred so far
    pub bytes_transferred: u64,
    /// Declared total bytes
    pub total_bytes: u64,
    /// Transfer speed in bytes per second
    pub speed_bps: u64,
    /// When the session started
    pub started_at: Instant,
}

impl TransferProgress {
    fn new(direction: SessionDirection) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            direction,
            state: SessionState::Handshaking,
            file_name: String::new(),
            bytes_transferred: 0,
            total_bytes: 0,
            speed_bps: 0,
            started_at: Instant::now(),
        }
    }

    /// Progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new(SessionDirection::List)
    }
}

/// One connection carrying one logical operation.
///
/// Sessions are created per call and never reused.
#[derive(Debug)]
pub struct TransferSession {
    peer: SocketAddr,
    progress: TransferProgress,
    observer: Option<Arc<watch::Sender<TransferProgress>>>,
    last_log: Instant,
}

impl TransferSession {
    /// Start a session in the handshaking state.
    pub fn new(
        direction: SessionDirection,
        peer: SocketAddr,
        observer: Option<Arc<watch::Sender<TransferProgress>>>,
    ) -> Self {
        let session = Self {
            peer,
            progress: TransferProgress::new(direction),
            observer,
            last_log: Instant::now(),
        };
        tracing::debug!(
            session = %session.progress.session_id,
            peer = %peer,
            direction = ?direction,
            "Session started"
        );
        session.publish();
        session
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.progress.session_id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.progress.state
    }

    /// Bytes transferred so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.progress.bytes_transferred
    }

    /// Move to the transmitting state for `file_name` of `total_bytes`.
    pub fn begin_transmit(&mut self, file_name: &str, total_bytes: u64) {
        self.progress.state = SessionState::Transmitting;
        self.progress.file_name = file_name.to_string();
        self.progress.total_bytes = total_bytes;
        self.progress.bytes_transferred = 0;
        self.publish();
    }

    /// Record the running byte total.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn advance(&mut self, bytes_transferred: u64) {
        self.progress.bytes_transferred = bytes_transferred;

        let elapsed = self.progress.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.progress.speed_bps = (bytes_transferred as f64 / elapsed) as u64;
        }

        if self.last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
            self.last_log = Instant::now();
            tracing::info!(
                session = %self.progress.session_id,
                "{}: {:.1}% ({} / {}, {:.1} KiB/s)",
                self.progress.file_name,
                self.progress.percentage(),
                format_size(bytes_transferred),
                format_size(self.progress.total_bytes),
                self.progress.speed_bps as f64 / 1024.0
            );
        }

        self.publish();
    }

    /// Finish the session according to the operation's result.
    pub fn finish<T>(&mut self, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.progress.state = SessionState::Completed;
                tracing::debug!(
                    session = %self.progress.session_id,
                    peer = %self.peer,
                    bytes = self.progress.bytes_transferred,
                    "Session completed"
                );
            }
            Err(e) => self.fail(e),
        }
        self.publish();
    }

    fn fail(&mut self, error: &Error) {
        self.progress.state = SessionState::Failed;
        if matches!(error, Error::Cancelled) {
            tracing::debug!(session = %self.progress.session_id, "Session cancelled");
        } else {
            tracing::warn!(
                session = %self.progress.session_id,
                peer = %self.peer,
                "Session failed: {}",
                error
            );
        }
    }

    fn publish(&self) {
        if let Some(observer) = &self.observer {
            observer.send_replace(self.progress.clone());
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        // Dropped mid-flight means the operation was abandoned
        if matches!(
            self.progress.state,
            SessionState::Handshaking | SessionState::Transmitting
        ) {
            self.fail(&Error::Cancelled);
            self.publish();
        }
    }
}
