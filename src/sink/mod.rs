//! Remote sink for produced segments.
//!
//! Uploading segments to third-party storage is optional and strictly
//! best-effort: a failed upload is logged and the collection run carries
//! on. The sink is a seam so that collection code never talks to a
//! concrete storage API directly.

mod drive;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use drive::DriveSink;

/// Identifier assigned by the remote storage service.
pub type RemoteFileId = String;

/// Errors from a remote sink. These never fail a collection run.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("rate limited by remote storage")]
    RateLimited,
}

/// Destination for produced segment files.
#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Upload a file into the given destination folder.
    async fn upload(
        &self,
        file_path: &Path,
        mime_type: &str,
        folder_id: &str,
    ) -> Result<RemoteFileId, SinkError>;
}
