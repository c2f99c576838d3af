/// Append-only on-disk journal of snapshots since the last rotation
///
/// Records are compact JSON tuples separated by `,\n`, so wrapping the whole
/// file in `[` `]` yields a JSON array.
use log::{info, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::models::Snapshot;
use crate::storage::StorageError;

pub const RECORD_SEPARATOR: &str = ",\n";

/// Parse journal text record by record, skipping lines that are not valid snapshots
///
/// Returns the parsed snapshots and the number of skipped lines.
pub fn parse_records(text: &str) -> (Vec<Snapshot>, usize) {
    let mut snapshots = Vec::new();
    let mut skipped = 0;
    for line in text.lines() {
        let record = line.trim().trim_end_matches(',');
        if record.is_empty() {
            continue;
        }
        match serde_json::from_str::<Snapshot>(record) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => {
                warn!("Skipping unreadable record: {}", e);
                skipped += 1;
            }
        }
    }
    (snapshots, skipped)
}

/// Join records in journal format
pub fn format_records(snapshots: &[Snapshot]) -> Result<String, StorageError> {
    let mut records = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        records.push(serde_json::to_string(snapshot)?);
    }
    Ok(records.join(RECORD_SEPARATOR))
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: PathBuf) -> Self {
        Journal { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every stored snapshot
    ///
    /// A torn record left by a crash (including a dangling separator or a
    /// cut multi-byte character) is dropped and the file is rewritten with
    /// the remaining records so later appends stay well-formed.
    pub fn replay(&self) -> Result<Vec<Snapshot>, StorageError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let (snapshots, skipped) = parse_records(&String::from_utf8_lossy(&raw));
        // Anything but the exact record list means the tail was torn
        let canonical = format_records(&snapshots)?;
        if canonical.as_bytes() != raw.as_slice() {
            warn!(
                "Rewriting {} without {} damaged record(s)",
                self.path.display(),
                skipped
            );
            self.rewrite(&canonical)?;
        }
        info!(
            "Replayed {} snapshots from {}",
            snapshots.len(),
            self.path.display()
        );
        Ok(snapshots)
    }

    /// Stored snapshots without touching the file
    pub fn snapshots(&self) -> Result<Vec<Snapshot>, StorageError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(parse_records(&String::from_utf8_lossy(&raw)).0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append one snapshot and flush it to the device before returning
    pub fn append(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // Separator and record go out in one write
        let mut record = Vec::new();
        if file.metadata()?.len() > 0 {
            record.extend_from_slice(RECORD_SEPARATOR.as_bytes());
        }
        serde_json::to_writer(&mut record, snapshot)?;
        file.write_all(&record)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Start a fresh journal
    pub fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rewrite(&self, records: &str) -> Result<(), StorageError> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(records.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceMap, DeviceRecord, Reading};

    fn snapshot(ts: i64) -> Snapshot {
        let mut devices = DeviceMap::new();
        devices.insert(
            "meter1".to_string(),
            DeviceRecord {
                dat: Reading::new().with("dcE1", ts % 300).with("name", "Bedroom"),
                ut: ts - 5,
            },
        );
        Snapshot::new(ts, devices)
    }

    #[test]
    fn appended_file_is_a_bracketless_array() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("record.txt"));
        let appended: Vec<Snapshot> = (0..3).map(|i| snapshot(1000 + i * 60)).collect();
        for s in &appended {
            journal.append(s).unwrap();
        }

        let text = fs::read_to_string(journal.path()).unwrap();
        assert_eq!(text.matches(",\n").count(), 2);
        let parsed: Vec<Snapshot> = serde_json::from_str(&format!("[{}]", text)).unwrap();
        assert_eq!(parsed, appended);
        assert_eq!(journal.replay().unwrap(), appended);
    }

    #[test]
    fn torn_tail_is_dropped_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("record.txt"));
        journal.append(&snapshot(1000)).unwrap();
        journal.append(&snapshot(1060)).unwrap();
        let mut file = OpenOptions::new().append(true).open(journal.path()).unwrap();
        file.write_all(b",\n[1120,{\"meter1\":{\"dat\"").unwrap();
        drop(file);

        let replayed = journal.replay().unwrap();
        assert_eq!(replayed, vec![snapshot(1000), snapshot(1060)]);

        journal.append(&snapshot(1180)).unwrap();
        let text = fs::read_to_string(journal.path()).unwrap();
        let parsed: Vec<Snapshot> = serde_json::from_str(&format!("[{}]", text)).unwrap();
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn missing_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("record.txt"));
        assert!(journal.replay().unwrap().is_empty());
        assert!(journal.snapshots().unwrap().is_empty());
        journal.clear().unwrap();
    }

    fn assert_bracket_wrappable(journal: &Journal, expected: usize) {
        let text = fs::read_to_string(journal.path()).unwrap();
        let parsed: Vec<Snapshot> = serde_json::from_str(&format!("[{}]", text)).unwrap();
        assert_eq!(parsed.len(), expected);
    }

    #[test]
    fn dangling_separator_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("record.txt"));
        journal.append(&snapshot(1000)).unwrap();
        let mut file = OpenOptions::new().append(true).open(journal.path()).unwrap();
        file.write_all(RECORD_SEPARATOR.as_bytes()).unwrap();
        drop(file);

        assert_eq!(journal.replay().unwrap(), vec![snapshot(1000)]);
        journal.append(&snapshot(1060)).unwrap();
        assert_bracket_wrappable(&journal, 2);
    }

    #[test]
    fn torn_multibyte_name_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("record.txt"));
        let mut named = snapshot(1000);
        if let Some(record) = named.devices.get_mut("meter1") {
            record.dat.insert("name", "寝室");
        }
        journal.append(&named).unwrap();

        // Second copy cut one byte into the first character of the name
        let full = serde_json::to_vec(&named).unwrap();
        let cut = full.windows(3).position(|w| w == "寝".as_bytes()).unwrap() + 1;
        let mut file = OpenOptions::new().append(true).open(journal.path()).unwrap();
        file.write_all(RECORD_SEPARATOR.as_bytes()).unwrap();
        file.write_all(&full[..cut]).unwrap();
        drop(file);

        assert_eq!(journal.replay().unwrap(), vec![named.clone()]);
        journal.append(&snapshot(1060)).unwrap();
        assert_bracket_wrappable(&journal, 2);
        assert_eq!(journal.snapshots().unwrap()[0], named);
    }

    #[test]
    fn intact_journal_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("record.txt"));
        journal.append(&snapshot(1000)).unwrap();
        journal.append(&snapshot(1060)).unwrap();
        let before = fs::read(journal.path()).unwrap();
        journal.replay().unwrap();
        assert_eq!(fs::read(journal.path()).unwrap(), before);
        assert!(!journal.path().with_extension("tmp").exists());
    }
}
