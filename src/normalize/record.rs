//! Canonical flat record shape for collected messages.

use serde::{Deserialize, Serialize};

/// One collected message in canonical flat form.
///
/// Every field is always present. Fields that can be absent upstream hold
/// an empty string rather than being omitted, so the same record shape
/// serializes to both newline-delimited JSON and csv rows without schema
/// drift between segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: i64,
    pub thread_num_id: String,
    pub thread_id: String,
    pub author: String,
    pub author_username: String,
    pub author_name: String,
    pub author_is_bot: String,
    pub body: String,
    pub reply_to: String,
    pub views: String,
    pub timestamp: String,
    pub unix_timestamp: i64,
    pub timestamp_edited: String,
    pub unix_timestamp_edited: String,
    pub author_forwarded_from_name: String,
    pub author_forwarded_from_username: String,
    pub timestamp_forwarded_from: String,
    pub unix_timestamp_forwarded_from: String,
    pub attachment_type: String,
    pub attachment_data: String,
    pub attachment_filename: String,
}
