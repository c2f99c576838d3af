/// Read-only access to the snapshot log for clients
use log::debug;
use serde::Serialize;
use std::sync::Arc;

use crate::models::Snapshot;
use crate::storage::archive::{gzip, ArchiveStore};
use crate::storage::SnapshotWindow;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct QueryService {
    window: SnapshotWindow,
    archive: ArchiveStore,
}

impl QueryService {
    pub fn new(window: SnapshotWindow, archive: ArchiveStore) -> Self {
        QueryService { window, archive }
    }

    /// Snapshots with a timestamp strictly after `after`, oldest first
    pub async fn snapshots_since(&self, after: i64) -> Vec<Arc<Snapshot>> {
        self.window.since(after).await
    }

    /// gzip-compressed JSON array of the snapshots after `after`
    pub async fn changes_since(&self, after: i64) -> Result<Vec<u8>, QueryError> {
        let snapshots = self.snapshots_since(after).await;
        debug!("Changes since {}: {} snapshots", after, snapshots.len());
        tokio::task::spawn_blocking(move || compressed_json(&snapshots)).await?
    }

    /// Archived dates (`YYYYMMDD`), all years when `year` is `None`
    pub async fn archive_dates(&self, year: Option<i32>) -> Result<Vec<String>, QueryError> {
        let archive = self.archive.clone();
        Ok(tokio::task::spawn_blocking(move || archive.dates(year)).await??)
    }

    /// gzip-compressed JSON array of archived dates
    pub async fn list_archives(&self, year: Option<i32>) -> Result<Vec<u8>, QueryError> {
        let dates = self.archive_dates(year).await?;
        tokio::task::spawn_blocking(move || compressed_json(&dates)).await?
    }

    /// Stored bytes of one day's archive
    ///
    /// The content is gzip of comma-joined records without the enclosing
    /// brackets; the client adds `[` and `]` after decompressing.
    pub async fn fetch_archive(&self, date: &str) -> Result<Option<Vec<u8>>, QueryError> {
        let archive = self.archive.clone();
        let date = date.to_string();
        Ok(tokio::task::spawn_blocking(move || archive.read(&date)).await??)
    }
}

fn compressed_json<T: Serialize>(value: &T) -> Result<Vec<u8>, QueryError> {
    Ok(gzip(&serde_json::to_vec(value)?)?)
}
