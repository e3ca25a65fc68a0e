//! Application settings.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::collector::CollectorConfig;
use crate::segments::OutputFormat;

/// Default bookkeeping database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "telacquire.db";

/// Session artifacts subdirectory name.
const SESSIONS_SUBDIR: &str = "sessions";

/// Collected datasets subdirectory name.
const COLLECTIONS_SUBDIR: &str = "collections";

/// Application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Bookkeeping database filename inside the data directory.
    pub database_filename: String,
    /// Owner recorded on subfile registrations.
    pub owner: String,
    /// Rate-limit waits at or above this many seconds end the run.
    pub rate_limit_ceiling_secs: u64,
    /// Transient-timeout retries per entity.
    pub max_retries: u32,
    /// First retry delay in seconds; doubles per retry.
    pub retry_base_delay_secs: u64,
    /// Output format extension: "ndjson" or "csv".
    pub output_format: String,
    /// Google Drive folder to upload finished segments into.
    pub drive_folder_id: Option<String>,
    /// OAuth access token for the Drive upload sink.
    pub drive_access_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        // Default to the platform data dir for user data.
        // Falls back gracefully: data dir -> home dir -> current dir
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("telacquire");

        Self {
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            owner: "anonymous".to_string(),
            rate_limit_ceiling_secs: 600,
            max_retries: 3,
            retry_base_delay_secs: 10,
            output_format: "ndjson".to_string(),
            drive_folder_id: None,
            drive_access_token: None,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, or defaults if none exists.
    ///
    /// Without an explicit path, `telacquire.toml` in the working
    /// directory is tried first, then the platform config directory.
    /// `TELACQUIRE_DATA_DIR` overrides the data directory either way.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let candidates: Vec<PathBuf> = match path {
            Some(explicit) => vec![explicit.to_path_buf()],
            None => {
                let mut found = vec![PathBuf::from("telacquire.toml")];
                if let Some(config_dir) = dirs::config_dir() {
                    found.push(config_dir.join("telacquire").join("config.toml"));
                }
                found
            }
        };

        let mut settings = Settings::default();
        for candidate in candidates {
            if candidate.exists() {
                let contents = fs::read_to_string(&candidate)?;
                settings = toml::from_str(&contents)?;
                break;
            }
        }

        if let Ok(data_dir) = std::env::var("TELACQUIRE_DATA_DIR") {
            settings.data_dir = PathBuf::from(shellexpand::tilde(&data_dir).to_string());
        }

        Ok(settings)
    }

    /// Directory holding session artifacts.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_SUBDIR)
    }

    /// Directory holding collected datasets.
    pub fn collections_dir(&self) -> PathBuf {
        self.data_dir.join(COLLECTIONS_SUBDIR)
    }

    /// Full path of the bookkeeping database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Parse the configured output format.
    pub fn output_format(&self) -> crate::repository::Result<OutputFormat> {
        OutputFormat::from_extension(&self.output_format)
    }

    /// Collector tuning derived from these settings.
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            rate_limit_ceiling_secs: self.rate_limit_ceiling_secs,
            max_retries: self.max_retries,
            retry_base_delay_secs: self.retry_base_delay_secs,
        }
    }

    /// Ensure all directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(self.sessions_dir())?;
        fs::create_dir_all(self.collections_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.rate_limit_ceiling_secs, 600);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.retry_base_delay_secs, 10);
        assert_eq!(settings.output_format, "ndjson");
        assert!(settings.output_format().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            r#"
            data_dir = "/tmp/telacquire-test"
            output_format = "csv"
            rate_limit_ceiling_secs = 120
            "#,
        )
        .unwrap();

        let settings = Settings::load(Some(&config_path)).unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/telacquire-test"));
        assert_eq!(settings.output_format, "csv");
        assert_eq!(settings.rate_limit_ceiling_secs, 120);
        // unspecified fields keep their defaults
        assert_eq!(settings.max_retries, 3);
    }

    #[test]
    fn test_directory_layout() {
        let settings = Settings {
            data_dir: PathBuf::from("/data"),
            ..Default::default()
        };
        assert_eq!(settings.sessions_dir(), PathBuf::from("/data/sessions"));
        assert_eq!(
            settings.collections_dir(),
            PathBuf::from("/data/collections")
        );
        assert_eq!(
            settings.database_path(),
            PathBuf::from("/data/telacquire.db")
        );
    }
}
