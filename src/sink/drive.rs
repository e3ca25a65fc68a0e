//! Google Drive upload sink.
//!
//! Uses the Drive v3 multipart upload endpoint with a caller-supplied
//! OAuth access token. Token acquisition and refresh belong to the
//! surrounding application; this sink only performs the upload.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{RemoteFileId, RemoteSink, SinkError};

const UPLOAD_URL: &str =
    "https://www.googleapis.com/upload/drive/v3/files?uploadType=multipart&fields=id";

/// Sink uploading segments to a Google Drive folder.
pub struct DriveSink {
    client: reqwest::Client,
    access_token: String,
}

#[derive(Deserialize)]
struct DriveFileResponse {
    id: String,
}

impl DriveSink {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token: access_token.into(),
        }
    }

    /// Build a multipart/related body: a JSON metadata part followed by
    /// the file content part, as the Drive upload endpoint expects.
    fn related_body(
        boundary: &str,
        metadata: &serde_json::Value,
        mime_type: &str,
        content: &[u8],
    ) -> Vec<u8> {
        let mut body = Vec::with_capacity(content.len() + 512);
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata.to_string().as_bytes());
        body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        body
    }
}

#[async_trait]
impl RemoteSink for DriveSink {
    async fn upload(
        &self,
        file_path: &Path,
        mime_type: &str,
        folder_id: &str,
    ) -> Result<RemoteFileId, SinkError> {
        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "segment".to_string());
        debug!("Uploading {} to Drive folder {}", filename, folder_id);

        let content = tokio::fs::read(file_path)
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;

        let metadata = serde_json::json!({
            "name": filename,
            "mimeType": mime_type,
            "parents": [folder_id],
        });

        let boundary = format!("telacquire-{}", uuid::Uuid::new_v4().simple());
        let body = Self::related_body(&boundary, &metadata, mime_type, &content);

        let response = self
            .client
            .post(UPLOAD_URL)
            .bearer_auth(&self.access_token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SinkError::RateLimited);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected(format!("HTTP {}: {}", status, detail)));
        }

        let created: DriveFileResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;
        info!("Uploaded {} as Drive file {}", filename, created.id);
        Ok(created.id)
    }
}
