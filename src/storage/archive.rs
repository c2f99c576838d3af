/// Compressed daily archives: `rec{YYYYMMDD}.txt.gz`
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use time::Date;

use crate::models::Snapshot;
use crate::storage::journal::{format_records, parse_records, RECORD_SEPARATOR};
use crate::storage::StorageError;

const PREFIX: &str = "rec";
const SUFFIX: &str = ".txt.gz";

/// `YYYYMMDD` form used in archive names and query responses
pub fn date_key(date: Date) -> String {
    format!(
        "{:04}{:02}{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Date key of an archive file name, `None` for anything else in the directory
fn key_of(file_name: &str) -> Option<&str> {
    let key = file_name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    (key.len() == 8 && key.bytes().all(|b| b.is_ascii_digit())).then_some(key)
}

pub fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    MultiGzDecoder::new(data).read_to_end(&mut decoded)?;
    Ok(decoded)
}

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    dir: PathBuf,
}

impl ArchiveStore {
    pub fn new(dir: PathBuf) -> Self {
        ArchiveStore { dir }
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}{}", PREFIX, key, SUFFIX))
    }

    pub fn path_for(&self, date: Date) -> PathBuf {
        self.path_for_key(&date_key(date))
    }

    /// Compress journal records into the archive of `date`
    ///
    /// An archive already present for the date keeps its records and gets
    /// the new ones appended; records it already holds (a rotation that
    /// stopped before the journal was cleared) are not written twice. The
    /// file is replaced atomically.
    pub fn store(&self, date: Date, snapshots: &[Snapshot]) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(date);

        let (mut content, archived) = match fs::read(&path) {
            Ok(existing) => {
                let previous = gunzip(&existing)?;
                let (archived, _) = parse_records(&String::from_utf8_lossy(&previous));
                (previous, archived)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => (Vec::new(), Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let fresh: Vec<Snapshot> = snapshots
            .iter()
            .filter(|s| !archived.contains(s))
            .cloned()
            .collect();
        if fresh.is_empty() && path.exists() {
            info!("{} already holds these records", path.display());
            return Ok(path);
        }
        if !content.is_empty() && !fresh.is_empty() {
            content.extend_from_slice(RECORD_SEPARATOR.as_bytes());
        }
        content.extend_from_slice(format_records(&fresh)?.as_bytes());

        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&gzip(&content)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        info!("Archived {} records to {}", fresh.len(), path.display());
        Ok(path)
    }

    /// Archived dates as `YYYYMMDD`, ascending, optionally limited to one year
    pub fn dates(&self, year: Option<i32>) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut dates = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(key) = name.to_str().and_then(key_of) else {
                continue;
            };
            if let Some(year) = year {
                if key[..4].parse::<i32>().ok() != Some(year) {
                    continue;
                }
            }
            dates.push(key.to_string());
        }
        dates.sort();
        Ok(dates)
    }

    /// Raw compressed bytes of one day, `None` if that day was never archived
    pub fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        if key.len() != 8 || !key.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }
        match fs::read(self.path_for_key(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceMap;
    use time::macros::date;

    fn empty(ts: i64) -> Snapshot {
        Snapshot::new(ts, DeviceMap::new())
    }

    #[test]
    fn names_follow_calendar_date() {
        let store = ArchiveStore::new(PathBuf::from("archive"));
        assert_eq!(date_key(date!(2024 - 01 - 05)), "20240105");
        assert_eq!(
            store.path_for(date!(2024 - 10 - 20)),
            PathBuf::from("archive/rec20241020.txt.gz")
        );
    }

    #[test]
    fn lists_and_filters_dates() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path().to_path_buf());
        assert!(store.dates(None).unwrap().is_empty());

        store.store(date!(2024 - 12 - 31), &[empty(1)]).unwrap();
        store.store(date!(2025 - 01 - 01), &[empty(2)]).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(store.dates(None).unwrap(), vec!["20241231", "20250101"]);
        assert_eq!(store.dates(Some(2025)).unwrap(), vec!["20250101"]);
        assert!(store.dates(Some(2023)).unwrap().is_empty());
    }

    #[test]
    fn same_day_rotation_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path().to_path_buf());
        store.store(date!(2024 - 10 - 20), &[empty(1)]).unwrap();
        store.store(date!(2024 - 10 - 20), &[empty(2)]).unwrap();

        let bytes = store.read("20241020").unwrap().unwrap();
        assert_eq!(gunzip(&bytes).unwrap(), b"[1,{}],\n[2,{}]");
        assert!(store.read("20241021").unwrap().is_none());
        assert!(store.read("../x").unwrap().is_none());
    }

    #[test]
    fn repeated_rotation_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path().to_path_buf());
        let day = date!(2024 - 10 - 20);
        store.store(day, &[empty(1), empty(2)]).unwrap();
        // Same journal again, plus one record written after the restart
        store.store(day, &[empty(1), empty(2)]).unwrap();
        store.store(day, &[empty(1), empty(2), empty(3)]).unwrap();

        let bytes = gunzip(&store.read("20241020").unwrap().unwrap()).unwrap();
        let archived: Vec<Snapshot> =
            serde_json::from_str(&format!("[{}]", String::from_utf8(bytes).unwrap())).unwrap();
        assert_eq!(archived, vec![empty(1), empty(2), empty(3)]);
    }
}
