//! Output segment persistence.
//!
//! A collection run produces one or more segment files. The first flush of
//! a run claims the dataset's canonical primary output path; every later
//! flush gets a timestamp-suffixed name so each is a distinct file. Writes
//! are all-or-nothing: records are serialized to a temporary file which is
//! renamed into place, so an interrupted run never leaves a half-written
//! segment behind.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;

use crate::normalize::NormalizedRecord;
use crate::repository::{
    MarkerRepository, Result, StoreError, SubfileRecord, SubfileRepository,
};

/// Serialization formats a dataset can be written as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Newline-delimited JSON, one record per line.
    NdJson,
    /// Tabular csv with a header row.
    Csv,
}

impl OutputFormat {
    /// Parse a requested format by file extension.
    pub fn from_extension(extension: &str) -> Result<Self> {
        match extension.trim_start_matches('.') {
            "ndjson" => Ok(OutputFormat::NdJson),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(StoreError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::NdJson => "ndjson",
            OutputFormat::Csv => "csv",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::NdJson => "application/x-ndjson",
            OutputFormat::Csv => "text/csv",
        }
    }
}

/// Segment store for a single dataset.
///
/// Owns the primary output path convention, the subfile registry rows and
/// the checkpoint markers for one run key. Mutated only by the worker that
/// owns the run.
pub struct SegmentStore {
    key: String,
    primary_path: PathBuf,
    format: OutputFormat,
    owner: String,
    subfiles: SubfileRepository,
    markers: MarkerRepository,
}

impl SegmentStore {
    /// Open the store for a dataset key.
    ///
    /// The primary output path is `<base_dir>/<key>/<key>.<ext>`; the
    /// bookkeeping database lives at `db_path`.
    pub fn open(
        base_dir: &Path,
        db_path: &Path,
        key: &str,
        format: OutputFormat,
        owner: &str,
    ) -> Result<Self> {
        let dataset_dir = base_dir.join(key);
        fs::create_dir_all(&dataset_dir)?;
        let primary_path = dataset_dir.join(format!("{}.{}", key, format.extension()));

        Ok(Self {
            key: key.to_string(),
            primary_path,
            format,
            owner: owner.to_string(),
            subfiles: SubfileRepository::new(db_path)?,
            markers: MarkerRepository::new(db_path)?,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary_path
    }

    /// Path of an initial-named segment written by the pre-promotion
    /// naming convention.
    fn initial_path(&self) -> PathBuf {
        self.sibling_path("initial")
    }

    fn sibling_path(&self, suffix: &str) -> PathBuf {
        let stem = self
            .primary_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.key.clone());
        self.primary_path
            .with_file_name(format!("{}-{}.{}", stem, suffix, self.format.extension()))
    }

    /// Choose the path for the next segment.
    ///
    /// The very first flush of a run is the dataset's canonical primary
    /// output; later flushes are timestamp-suffixed. A suffix collision
    /// (two flushes within one second) falls back to a counter.
    pub fn begin_segment(&self, is_initial: bool) -> PathBuf {
        if is_initial {
            return self.primary_path.clone();
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut candidate = self.sibling_path(&stamp);
        let mut n = 2;
        while candidate.exists() {
            candidate = self.sibling_path(&format!("{}-{}", stamp, n));
            n += 1;
        }
        candidate
    }

    /// Serialize records to a segment file, atomically.
    pub fn write_segment(&self, records: &[NormalizedRecord], path: &Path) -> Result<()> {
        let mut buffer: Vec<u8> = Vec::new();
        match self.format {
            OutputFormat::NdJson => {
                for record in records {
                    serde_json::to_writer(&mut buffer, record)?;
                    buffer.push(b'\n');
                }
            }
            OutputFormat::Csv => {
                let mut writer = csv::Writer::from_writer(&mut buffer);
                for record in records {
                    writer.serialize(record)?;
                }
                writer.flush()?;
                drop(writer);
            }
        }

        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&buffer)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!("Wrote {} records to {}", records.len(), path.display());
        Ok(())
    }

    /// Register a segment in the subfile registry. Idempotent.
    pub fn register_segment(&self, path: &Path, file_type: &str) -> Result<SubfileRecord> {
        self.subfiles
            .register(&self.key, &path.to_string_lossy(), file_type, &self.owner)
    }

    /// Record a successful remote upload for a segment.
    pub fn mark_uploaded(&self, record: &mut SubfileRecord) -> Result<()> {
        self.subfiles.mark_uploaded(record, Utc::now())
    }

    /// List every segment registered for this dataset.
    pub fn registered_segments(&self) -> Result<Vec<SubfileRecord>> {
        self.subfiles.list_for(&self.key)
    }

    /// Read the checkpoint marker set for this dataset.
    pub fn checkpoint_markers(&self) -> Result<HashMap<String, i64>> {
        self.markers.get_markers(&self.key)
    }

    /// Persist a batch of records as a new segment.
    ///
    /// Records must already be in on-disk order (oldest first). The
    /// checkpoint markers are updated from the batch even when it is
    /// empty enough to skip the write. Returns the registered record for
    /// the new segment, if one was written.
    pub fn flush(
        &self,
        records: &[NormalizedRecord],
        is_initial: bool,
    ) -> Result<Option<SubfileRecord>> {
        let written = if records.is_empty() {
            None
        } else {
            let path = self.begin_segment(is_initial);
            self.write_segment(records, &path)?;
            let record = self.register_segment(&path, self.format.extension())?;
            info!(
                "Flushed {} records to segment {}",
                records.len(),
                path.display()
            );
            Some(record)
        };

        self.update_markers_from(records)?;
        Ok(written)
    }

    /// Update checkpoint markers from a flushed batch.
    ///
    /// The batch is oldest-first, so the last occurrence per channel is
    /// that channel's most recent persisted message. Records whose chat
    /// could not be identified produce no marker.
    fn update_markers_from(&self, records: &[NormalizedRecord]) -> Result<()> {
        let mut latest: HashMap<String, i64> = HashMap::new();
        for record in records {
            if record.thread_num_id.parse::<i64>().is_ok() {
                latest.insert(record.thread_num_id.clone(), record.id);
            }
        }
        self.markers.update_markers(&self.key, &latest)
    }

    /// Bundle every registered segment into a single zip archive.
    ///
    /// Invoked on clean stop of a continuous collection. Returns the
    /// archive path.
    pub fn bundle_archive(&self) -> Result<PathBuf> {
        let archive_path = PathBuf::from(format!("{}.zip", self.primary_path.display()));
        let file = fs::File::create(&archive_path)?;
        let mut archive = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        for record in self.registered_segments()? {
            let path = PathBuf::from(&record.file_path);
            if !path.exists() {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| record.file_path.clone());
            archive.start_file(name, options)?;
            let mut source = fs::File::open(&path)?;
            std::io::copy(&mut source, &mut archive)?;
        }

        archive.finish()?;
        info!("Bundled segments into {}", archive_path.display());
        Ok(archive_path)
    }

    /// Rename an initial-named segment to the primary output path.
    ///
    /// Datasets written under the older naming convention have their
    /// first segment at `<stem>-initial.<ext>`; after the run concludes
    /// it becomes the primary output. Returns whether a rename happened.
    pub fn promote_initial_segment(&self) -> Result<bool> {
        let initial = self.initial_path();
        if !initial.exists() || initial == self.primary_path {
            return Ok(false);
        }

        fs::rename(&initial, &self.primary_path)?;
        self.subfiles
            .remove(&self.key, &initial.to_string_lossy())?;
        self.register_segment(&self.primary_path, self.format.extension())?;
        info!(
            "Promoted initial segment to {}",
            self.primary_path.display()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, channel: &str) -> NormalizedRecord {
        let mut record = crate::normalize::to_canonical_record(&serde_json::json!({
            "id": id,
            "date": 1650000000 + id,
            "message": format!("message {}", id),
        }));
        record.thread_num_id = channel.to_string();
        record.thread_id = "testchannel".to_string();
        record
    }

    fn store(dir: &Path, format: OutputFormat) -> SegmentStore {
        SegmentStore::open(dir, &dir.join("book.db"), "run1", format, "anonymous").unwrap()
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            OutputFormat::from_extension("ndjson").unwrap(),
            OutputFormat::NdJson
        );
        assert_eq!(
            OutputFormat::from_extension(".csv").unwrap(),
            OutputFormat::Csv
        );
        assert!(matches!(
            OutputFormat::from_extension("parquet"),
            Err(StoreError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_initial_flush_is_primary() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputFormat::NdJson);
        let records = vec![record(1, "1000"), record(2, "1000")];
        let written = store.flush(&records, true).unwrap().unwrap();
        assert_eq!(
            written.file_path,
            store.primary_path().to_string_lossy().to_string()
        );
        assert!(store.primary_path().exists());
    }

    #[test]
    fn test_later_flushes_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputFormat::NdJson);
        store.flush(&[record(1, "1000")], true).unwrap();
        let a = store.flush(&[record(2, "1000")], false).unwrap().unwrap();
        let b = store.flush(&[record(3, "1000")], false).unwrap().unwrap();
        assert_ne!(a.file_path, b.file_path);
        assert_ne!(a.file_path, store.primary_path().to_string_lossy());
        assert!(PathBuf::from(&a.file_path).exists());
        assert!(PathBuf::from(&b.file_path).exists());
    }

    #[test]
    fn test_ndjson_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputFormat::NdJson);
        let records = vec![record(1, "1000"), record(2, "1000")];
        store.flush(&records, true).unwrap();

        let contents = fs::read_to_string(store.primary_path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: NormalizedRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, records[0]);
    }

    #[test]
    fn test_csv_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputFormat::Csv);
        store.flush(&[record(1, "1000")], true).unwrap();

        let contents = fs::read_to_string(store.primary_path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("id,thread_num_id,thread_id"));
    }

    #[test]
    fn test_flush_updates_markers_to_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputFormat::NdJson);
        // oldest first: newest id per channel must win
        let records = vec![record(10, "1000"), record(11, "2000"), record(12, "1000")];
        store.flush(&records, true).unwrap();

        let markers = store.checkpoint_markers().unwrap();
        assert_eq!(markers.get("1000"), Some(&12));
        assert_eq!(markers.get("2000"), Some(&11));
    }

    #[test]
    fn test_unidentified_chats_produce_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputFormat::NdJson);
        let records = vec![record(10, "unknown"), record(11, "error-no-id")];
        store.flush(&records, true).unwrap();
        assert!(store.checkpoint_markers().unwrap().is_empty());
    }

    #[test]
    fn test_empty_flush_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputFormat::NdJson);
        assert!(store.flush(&[], true).unwrap().is_none());
        assert!(!store.primary_path().exists());
        assert!(store.registered_segments().unwrap().is_empty());
    }

    #[test]
    fn test_bundle_contains_every_registered_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputFormat::NdJson);
        store.flush(&[record(1, "1000")], true).unwrap();
        store.flush(&[record(2, "1000")], false).unwrap();
        store.flush(&[record(3, "1000")], false).unwrap();

        let archive_path = store.bundle_archive().unwrap();
        let archive = zip::ZipArchive::new(fs::File::open(&archive_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 3);
    }

    #[test]
    fn test_promote_initial_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), OutputFormat::NdJson);

        // a first segment written under the older initial-name convention
        let initial = store.initial_path();
        store.write_segment(&[record(1, "1000")], &initial).unwrap();
        store.register_segment(&initial, "ndjson").unwrap();

        assert!(store.promote_initial_segment().unwrap());
        assert!(store.primary_path().exists());
        assert!(!initial.exists());

        let segments = store.registered_segments().unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(
            segments[0].file_path,
            store.primary_path().to_string_lossy().to_string()
        );

        // nothing left to promote
        assert!(!store.promote_initial_segment().unwrap());
    }
}
