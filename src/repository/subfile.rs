//! Subfile registry.
//!
//! A subfile is one physical output segment of a collection run, uniquely
//! identified by the run's parent key plus the file path. Rows are
//! append-only: once registered, only the uploaded date may change, and
//! only after a successful remote-sink upload.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{connect, parse_datetime, parse_datetime_opt, to_option, Result};

/// One registered output segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SubfileRecord {
    pub parent_key: String,
    pub file_path: String,
    pub file_type: String,
    pub saved_date: DateTime<Utc>,
    pub uploaded_date: Option<DateTime<Utc>>,
    pub owner: String,
}

/// SQLite-backed subfile registry.
pub struct SubfileRepository {
    db_path: PathBuf,
}

impl SubfileRepository {
    /// Create a new subfile repository.
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn connect(&self) -> Result<rusqlite::Connection> {
        connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS subfiles (
                parent_key TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_type TEXT NOT NULL,
                saved_date TEXT NOT NULL,
                uploaded_date TEXT,
                owner TEXT NOT NULL,
                PRIMARY KEY (parent_key, file_path)
            );
        "#,
        )?;
        Ok(())
    }

    /// Get a subfile record by its identifying pair.
    pub fn get(&self, parent_key: &str, file_path: &str) -> Result<Option<SubfileRecord>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM subfiles WHERE parent_key = ?1 AND file_path = ?2")?;

        to_option(stmt.query_row(params![parent_key, file_path], |row| {
            Ok(SubfileRecord {
                parent_key: row.get("parent_key")?,
                file_path: row.get("file_path")?,
                file_type: row.get("file_type")?,
                saved_date: parse_datetime(&row.get::<_, String>("saved_date")?),
                uploaded_date: parse_datetime_opt(row.get::<_, Option<String>>("uploaded_date")?),
                owner: row.get("owner")?,
            })
        }))
    }

    /// Register a segment, creating the row if it does not exist yet.
    ///
    /// Registering the same (parent_key, file_path) pair again returns the
    /// existing record untouched.
    pub fn register(
        &self,
        parent_key: &str,
        file_path: &str,
        file_type: &str,
        owner: &str,
    ) -> Result<SubfileRecord> {
        if let Some(existing) = self.get(parent_key, file_path)? {
            return Ok(existing);
        }

        let record = SubfileRecord {
            parent_key: parent_key.to_string(),
            file_path: file_path.to_string(),
            file_type: file_type.to_string(),
            saved_date: Utc::now(),
            uploaded_date: None,
            owner: owner.to_string(),
        };

        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO subfiles (parent_key, file_path, file_type, saved_date, uploaded_date, owner)
            VALUES (?1, ?2, ?3, ?4, NULL, ?5)
            ON CONFLICT(parent_key, file_path) DO NOTHING
            "#,
            params![
                record.parent_key,
                record.file_path,
                record.file_type,
                record.saved_date.to_rfc3339(),
                record.owner,
            ],
        )?;

        Ok(record)
    }

    /// List all registered segments for a parent key, oldest first.
    pub fn list_for(&self, parent_key: &str) -> Result<Vec<SubfileRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM subfiles WHERE parent_key = ?1 ORDER BY saved_date, file_path",
        )?;

        let records = stmt
            .query_map(params![parent_key], |row| {
                Ok(SubfileRecord {
                    parent_key: row.get("parent_key")?,
                    file_path: row.get("file_path")?,
                    file_type: row.get("file_type")?,
                    saved_date: parse_datetime(&row.get::<_, String>("saved_date")?),
                    uploaded_date: parse_datetime_opt(
                        row.get::<_, Option<String>>("uploaded_date")?,
                    ),
                    owner: row.get("owner")?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Record a successful remote upload for a segment.
    pub fn mark_uploaded(
        &self,
        record: &mut SubfileRecord,
        uploaded_date: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE subfiles SET uploaded_date = ?1 WHERE parent_key = ?2 AND file_path = ?3",
            params![
                uploaded_date.to_rfc3339(),
                record.parent_key,
                record.file_path
            ],
        )?;
        record.uploaded_date = Some(uploaded_date);
        Ok(())
    }

    /// Remove a segment row, used when an initial-named segment is
    /// promoted to the primary output path.
    pub fn remove(&self, parent_key: &str, file_path: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM subfiles WHERE parent_key = ?1 AND file_path = ?2",
            params![parent_key, file_path],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, SubfileRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = SubfileRepository::new(&dir.path().join("test.db")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_register_and_get() {
        let (_dir, repo) = repo();
        let record = repo
            .register("key1", "/data/out.ndjson", "ndjson", "anonymous")
            .unwrap();
        assert_eq!(record.file_type, "ndjson");
        assert!(record.uploaded_date.is_none());

        let fetched = repo.get("key1", "/data/out.ndjson").unwrap().unwrap();
        assert_eq!(fetched.parent_key, "key1");
        assert_eq!(fetched.owner, "anonymous");
    }

    #[test]
    fn test_register_idempotent() {
        let (_dir, repo) = repo();
        let first = repo
            .register("key1", "/data/out.ndjson", "ndjson", "anonymous")
            .unwrap();
        let second = repo
            .register("key1", "/data/out.ndjson", "csv", "other")
            .unwrap();
        // second registration returns the original row
        assert_eq!(second.file_type, first.file_type);
        assert_eq!(second.owner, first.owner);
        assert_eq!(repo.list_for("key1").unwrap().len(), 1);
    }

    #[test]
    fn test_mark_uploaded() {
        let (_dir, repo) = repo();
        let mut record = repo
            .register("key1", "/data/out.ndjson", "ndjson", "anonymous")
            .unwrap();
        let when = Utc::now();
        repo.mark_uploaded(&mut record, when).unwrap();
        assert!(record.uploaded_date.is_some());

        let fetched = repo.get("key1", "/data/out.ndjson").unwrap().unwrap();
        assert_eq!(
            fetched.uploaded_date.unwrap().timestamp(),
            when.timestamp()
        );
    }

    #[test]
    fn test_list_scoped_to_key() {
        let (_dir, repo) = repo();
        repo.register("key1", "/data/a.ndjson", "ndjson", "anonymous")
            .unwrap();
        repo.register("key1", "/data/b.ndjson", "ndjson", "anonymous")
            .unwrap();
        repo.register("key2", "/data/c.ndjson", "ndjson", "anonymous")
            .unwrap();
        assert_eq!(repo.list_for("key1").unwrap().len(), 2);
        assert_eq!(repo.list_for("key2").unwrap().len(), 1);
    }

    #[test]
    fn test_remove() {
        let (_dir, repo) = repo();
        repo.register("key1", "/data/a.ndjson", "ndjson", "anonymous")
            .unwrap();
        repo.remove("key1", "/data/a.ndjson").unwrap();
        assert!(repo.get("key1", "/data/a.ndjson").unwrap().is_none());
    }
}
