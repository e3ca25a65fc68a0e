//! Checkpoint markers.
//!
//! For every channel a continuous collection touches, the id of the last
//! message that reached disk is recorded next to the dataset. On restart
//! the collection loop reads these markers back and fetches only newer
//! messages, so a crash between flushes neither re-delivers saved
//! messages nor silently skips unsaved ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::params;

use super::{connect, Result};

/// SQLite-backed checkpoint marker store.
pub struct MarkerRepository {
    db_path: PathBuf,
}

impl MarkerRepository {
    /// Create a new marker repository.
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
            CREATE TABLE IF NOT EXISTS update_markers (
                parent_key TEXT NOT NULL,
                channel TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                PRIMARY KEY (parent_key, channel)
            );
        "#,
        )?;
        Ok(())
    }

    /// Read the marker set for a run key. Empty on the first run.
    pub fn get_markers(&self, parent_key: &str) -> Result<HashMap<String, i64>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT channel, message_id FROM update_markers WHERE parent_key = ?1")?;

        let markers = stmt
            .query_map(params![parent_key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;

        Ok(markers)
    }

    /// Upsert markers after a successful flush.
    ///
    /// Only the channels present in `markers` are touched; markers for
    /// channels with nothing in the flushed batch keep their value.
    pub fn update_markers(&self, parent_key: &str, markers: &HashMap<String, i64>) -> Result<()> {
        if markers.is_empty() {
            return Ok(());
        }

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for (channel, message_id) in markers {
            tx.execute(
                r#"
                INSERT INTO update_markers (parent_key, channel, message_id)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(parent_key, channel) DO UPDATE SET message_id = excluded.message_id
                "#,
                params![parent_key, channel, message_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, MarkerRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = MarkerRepository::new(&dir.path().join("test.db")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_empty_on_first_run() {
        let (_dir, repo) = repo();
        assert!(repo.get_markers("key1").unwrap().is_empty());
    }

    #[test]
    fn test_update_and_read_back() {
        let (_dir, repo) = repo();
        let mut markers = HashMap::new();
        markers.insert("1000".to_string(), 42i64);
        markers.insert("2000".to_string(), 7i64);
        repo.update_markers("key1", &markers).unwrap();

        let read = repo.get_markers("key1").unwrap();
        assert_eq!(read.get("1000"), Some(&42));
        assert_eq!(read.get("2000"), Some(&7));
    }

    #[test]
    fn test_update_replaces_only_flushed_channels() {
        let (_dir, repo) = repo();
        let mut markers = HashMap::new();
        markers.insert("1000".to_string(), 42i64);
        markers.insert("2000".to_string(), 7i64);
        repo.update_markers("key1", &markers).unwrap();

        let mut newer = HashMap::new();
        newer.insert("1000".to_string(), 99i64);
        repo.update_markers("key1", &newer).unwrap();

        let read = repo.get_markers("key1").unwrap();
        assert_eq!(read.get("1000"), Some(&99));
        assert_eq!(read.get("2000"), Some(&7));
    }

    #[test]
    fn test_markers_scoped_per_key() {
        let (_dir, repo) = repo();
        let mut markers = HashMap::new();
        markers.insert("1000".to_string(), 42i64);
        repo.update_markers("key1", &markers).unwrap();
        assert!(repo.get_markers("key2").unwrap().is_empty());
    }
}
