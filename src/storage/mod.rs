/// Durable snapshot log: in-memory window, on-disk journal and daily archives
use log::{info, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use time::Date;
use tokio::sync::RwLock;

pub mod archive;
pub mod journal;

pub use archive::ArchiveStore;
pub use journal::Journal;

use crate::models::Snapshot;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Bounded, time-ordered list of the most recent snapshots
///
/// Cloning yields another handle on the same window. Readers copy out the
/// `Arc`s they need and release the lock before doing any work.
#[derive(Clone)]
pub struct SnapshotWindow {
    inner: Arc<RwLock<VecDeque<Arc<Snapshot>>>>,
    capacity: usize,
}

impl SnapshotWindow {
    pub fn new(capacity: usize) -> Self {
        Self::from_snapshots(Vec::new(), capacity)
    }

    /// Window seeded with the newest `capacity` of `snapshots`
    pub fn from_snapshots(snapshots: Vec<Snapshot>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let skip = snapshots.len().saturating_sub(capacity);
        let entries: VecDeque<Arc<Snapshot>> =
            snapshots.into_iter().skip(skip).map(Arc::new).collect();
        SnapshotWindow {
            inner: Arc::new(RwLock::new(entries)),
            capacity,
        }
    }

    /// Insert at the newest end, dropping the oldest entries beyond capacity
    pub async fn push(&self, snapshot: Arc<Snapshot>) {
        let mut entries = self.inner.write().await;
        entries.push_back(snapshot);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Snapshots strictly newer than `after`, oldest first
    pub async fn since(&self, after: i64) -> Vec<Arc<Snapshot>> {
        let entries = self.inner.read().await;
        // Walk back from the newest entry to the first one already delivered
        let mut start = entries.len();
        while start > 0 && entries[start - 1].timestamp > after {
            start -= 1;
        }
        entries.range(start..).cloned().collect()
    }

    pub async fn latest_timestamp(&self) -> Option<i64> {
        self.inner.read().await.back().map(|s| s.timestamp)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Writer side of the log; owned by the collector
pub struct TelemetryLog {
    window: SnapshotWindow,
    journal: Journal,
    archive: ArchiveStore,
}

impl TelemetryLog {
    /// Open the log, rebuilding the window from the journal
    ///
    /// # Arguments
    /// * `journal_path` - Live journal since the last rotation
    /// * `archive_dir` - Directory of daily archives
    /// * `capacity` - Number of snapshots kept in memory
    pub async fn open(
        journal_path: PathBuf,
        archive_dir: PathBuf,
        capacity: usize,
    ) -> Result<Self, StorageError> {
        let journal = Journal::new(journal_path);
        let replayed = journal.clone();
        let snapshots = tokio::task::spawn_blocking(move || replayed.replay()).await??;
        Ok(TelemetryLog {
            window: SnapshotWindow::from_snapshots(snapshots, capacity),
            journal,
            archive: ArchiveStore::new(archive_dir),
        })
    }

    /// Read handle on the in-memory window
    pub fn window(&self) -> SnapshotWindow {
        self.window.clone()
    }

    pub fn archive(&self) -> ArchiveStore {
        self.archive.clone()
    }

    /// Persist a snapshot, then publish it to readers
    ///
    /// A timestamp older than the newest entry (clock stepped back) is raised
    /// to that entry's timestamp so the log stays non-decreasing.
    pub async fn append(&self, mut snapshot: Snapshot) -> Result<Arc<Snapshot>, StorageError> {
        if let Some(latest) = self.window.latest_timestamp().await {
            if snapshot.timestamp < latest {
                warn!(
                    "Clock went back {}s, keeping timestamp {}",
                    latest - snapshot.timestamp,
                    latest
                );
                snapshot.timestamp = latest;
            }
        }

        let snapshot = Arc::new(snapshot);
        let journal = self.journal.clone();
        let record = snapshot.clone();
        tokio::task::spawn_blocking(move || journal.append(&record)).await??;
        self.window.push(snapshot.clone()).await;
        Ok(snapshot)
    }

    /// Move the journal into the archive of `date` and start a new journal
    ///
    /// Returns the archive path, or `None` when the journal was empty. The
    /// in-memory window is left untouched.
    pub async fn rotate(&self, date: Date) -> Result<Option<PathBuf>, StorageError> {
        let journal = self.journal.clone();
        let archive = self.archive.clone();
        tokio::task::spawn_blocking(move || archive_journal(&journal, &archive, date)).await?
    }
}

fn archive_journal(
    journal: &Journal,
    archive: &ArchiveStore,
    date: Date,
) -> Result<Option<PathBuf>, StorageError> {
    let snapshots = journal.snapshots()?;
    if snapshots.is_empty() {
        info!("Nothing to archive for {}", archive::date_key(date));
        return Ok(None);
    }
    let path = archive.store(date, &snapshots)?;
    journal.clear()?;
    Ok(Some(path))
}
