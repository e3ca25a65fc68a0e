//! Session identity and authentication lifecycle.
//!
//! Each set of API credentials maps to a stable on-disk session artifact.
//! The artifact name is a one-way hash so that a directory listing never
//! reveals a phone number. Opening a session drives the transport's login
//! flow with at-most-one security-code attempt per call.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportError};

/// API credentials supplied by the requesting user.
///
/// Held only long enough to derive a session identity and open the
/// transport; callers that did not ask to retain them should drop this
/// value as soon as the session is established.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_id: i32,
    pub api_hash: String,
    pub phone: String,
}

/// Authentication failures that require caller intervention.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A verification code was sent to the account and must be supplied
    /// on the next attempt. The continuation names the pending session.
    #[error("a security code was sent to the account; re-submit with the code")]
    NeedsCode { continuation: String },

    /// The stored session can no longer authenticate; the artifact has
    /// been deleted and a fresh code must be requested.
    #[error("session is not authenticated: the login security code may have expired")]
    CodeExpired,

    /// Anything else the transport reported while connecting.
    #[error("error connecting to the Telegram API: {0}")]
    Failed(String),
}

/// Compute the session identity for a set of credentials.
///
/// Strips `+` and whitespace from the phone number, concatenates it with
/// the API id and hash, and returns the hex digest. Identical credentials
/// always produce the same identity, and the digest does not allow
/// recovery of the phone number.
pub fn compute_session_id(phone: &str, api_id: i32, api_hash: &str) -> String {
    let phone: String = phone
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '+')
        .collect();
    let base = format!("{}{}{}", phone, api_id, api_hash.trim());
    blake3::hash(base.as_bytes()).to_hex().to_string()
}

/// Short random code appended to a session id when more than one
/// collection runs concurrently for the same phone number.
pub fn disambiguation_code() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..4].to_string()
}

/// Manages session artifacts under a root directory.
pub struct SessionManager {
    root: PathBuf,
}

impl SessionManager {
    /// Create a manager, ensuring the root directory exists.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Path of the on-disk artifact for a session id.
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.session", session_id))
    }

    /// Whether an artifact exists for a session id.
    pub fn artifact_exists(&self, session_id: &str) -> bool {
        self.session_path(session_id).exists()
    }

    /// Delete the artifact for a session id, if present.
    pub fn discard_artifact(&self, session_id: &str) -> io::Result<()> {
        let path = self.session_path(session_id);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("Removed session artifact {}", path.display());
        }
        Ok(())
    }

    /// List the session ids with artifacts on disk.
    pub fn list_sessions(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".session") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Open and authenticate a session.
    ///
    /// At most one security-code attempt is made: if the transport still
    /// asks for a code after `code` was supplied, a fresh
    /// [`AuthError::NeedsCode`] is returned rather than looping. A stale
    /// artifact is deleted so the user is asked for a new code on the
    /// next request.
    pub async fn open(
        &self,
        transport: &dyn Transport,
        session_id: &str,
        credentials: &Credentials,
        code: Option<&str>,
    ) -> Result<(), AuthError> {
        let path = self.session_path(session_id);
        info!("Opening session {}", session_id);

        match transport.start(&path, credentials, code).await {
            Ok(()) => Ok(()),
            Err(TransportError::AuthExpired) => {
                warn!("Session {} is no longer usable, removing artifact", session_id);
                transport.disconnect().await;
                self.discard_artifact(session_id)
                    .map_err(|e| AuthError::Failed(e.to_string()))?;
                Err(AuthError::CodeExpired)
            }
            Err(TransportError::CodeRequested) => {
                transport.disconnect().await;
                Err(AuthError::NeedsCode {
                    continuation: session_id.to_string(),
                })
            }
            Err(e) => {
                transport.disconnect().await;
                Err(AuthError::Failed(e.to_string()))
            }
        }
    }
}
