//! Message normalization.
//!
//! Upstream message objects arrive as deeply nested, loosely typed trees.
//! Normalization happens in two steps: [`flatten`] converts a [`RawValue`]
//! tree into a plain serializable mapping, and [`to_canonical_record`]
//! maps that into the flat record shape every output segment uses.
//!
//! Both steps are total: unknown variants are dropped, missing fields
//! degrade to documented defaults, and no input can make them fail.

mod record;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

pub use record::NormalizedRecord;

use crate::transport::{RawValue, TYPE_KEY};

/// Recursively convert an upstream object tree into a serializable mapping.
///
/// Timestamps become epoch seconds, byte blobs become hex strings, tagged
/// objects become mappings carrying their origin type under [`TYPE_KEY`],
/// and lists are converted element-wise. Values the transport marked as
/// opaque do not survive; only fields of interest to the canonical record
/// need to. Flattening an already-flattened mapping is a no-op copy.
pub fn flatten(value: &RawValue) -> Value {
    match value {
        RawValue::Null => Value::Null,
        RawValue::Bool(b) => Value::Bool(*b),
        RawValue::Int(i) => Value::from(*i),
        RawValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        RawValue::Str(s) => Value::String(s.clone()),
        RawValue::Bytes(b) => Value::String(hex::encode(b)),
        RawValue::Date(d) => Value::from(d.timestamp()),
        RawValue::List(items) => Value::Array(
            items
                .iter()
                .filter(|item| !matches!(item, RawValue::Opaque(_)))
                .map(flatten)
                .collect(),
        ),
        RawValue::Map(fields) => flatten_fields(fields, None),
        RawValue::Object { type_name, fields } => flatten_fields(fields, Some(type_name)),
        RawValue::Opaque(_) => Value::Null,
    }
}

fn flatten_fields(fields: &BTreeMap<String, RawValue>, type_name: Option<&str>) -> Value {
    let mut out = serde_json::Map::new();
    for (key, value) in fields {
        // unrecognized upstream types do not survive flattening
        if matches!(value, RawValue::Opaque(_)) {
            continue;
        }
        out.insert(key.clone(), flatten(value));
    }
    if let Some(name) = type_name {
        out.insert(TYPE_KEY.to_string(), Value::String(name.to_string()));
    }
    Value::Object(out)
}

/// Attachment categories recognized on a message's media field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    None,
    Contact,
    Document,
    Photo,
    Poll,
    Url,
    Game,
    Geo,
    GeoLive,
    Invoice,
    Unsupported,
    Venue,
}

impl AttachmentKind {
    /// Textual identifier used in the canonical record. Messages without
    /// an attachment carry an empty string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::None => "",
            AttachmentKind::Contact => "contact",
            AttachmentKind::Document => "document",
            AttachmentKind::Photo => "photo",
            AttachmentKind::Poll => "poll",
            AttachmentKind::Url => "url",
            AttachmentKind::Game => "game",
            AttachmentKind::Geo => "geo",
            AttachmentKind::GeoLive => "geo_live",
            AttachmentKind::Invoice => "invoice",
            AttachmentKind::Unsupported => "unsupported",
            AttachmentKind::Venue => "venue",
        }
    }
}

/// Classify a flattened media mapping by its upstream type tag.
///
/// Absent or unrecognized tags degrade to [`AttachmentKind::None`].
pub fn classify_attachment(media: &Value) -> AttachmentKind {
    match media.get(TYPE_KEY).and_then(Value::as_str) {
        Some("MessageMediaContact") => AttachmentKind::Contact,
        Some("MessageMediaDocument") => AttachmentKind::Document,
        Some("MessageMediaPhoto") => AttachmentKind::Photo,
        Some("MessageMediaPoll") => AttachmentKind::Poll,
        Some("MessageMediaWebPage") => AttachmentKind::Url,
        Some("MessageMediaGame") => AttachmentKind::Game,
        Some("MessageMediaGeo") => AttachmentKind::Geo,
        Some("MessageMediaGeoLive") => AttachmentKind::GeoLive,
        Some("MessageMediaInvoice") => AttachmentKind::Invoice,
        Some("MessageMediaUnsupported") => AttachmentKind::Unsupported,
        Some("MessageMediaVenue") => AttachmentKind::Venue,
        _ => AttachmentKind::None,
    }
}

/// Extract kind-specific attachment data and filename.
///
/// The data string is serialized JSON for structured attachments, a bare
/// URL for link previews, and empty otherwise. Absent sub-fields degrade
/// to nulls or empty values; this never fails.
pub fn extract_attachment_data(
    kind: AttachmentKind,
    media: &Value,
    thread: &str,
    record_id: i64,
) -> (String, String) {
    match kind {
        AttachmentKind::Contact => {
            // contact data has appeared both nested under a "contact" key
            // and flattened directly onto the media mapping
            let source = match media.get("contact") {
                Some(contact) if contact.is_object() => contact,
                _ => media,
            };
            let mut data = serde_json::Map::new();
            for field in ["phone_number", "first_name", "last_name", "vcard", "user_id"] {
                data.insert(
                    field.to_string(),
                    source.get(field).cloned().unwrap_or(Value::Null),
                );
            }
            (Value::Object(data).to_string(), String::new())
        }
        AttachmentKind::Document => {
            let mime = media
                .get("document")
                .and_then(|d| d.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if mime.starts_with("video") {
                (file_pointer(media.get("document")), String::new())
            } else {
                (String::new(), String::new())
            }
        }
        AttachmentKind::Photo => {
            // photo metadata itself is of little interest; the pointer is
            // enough to download the file in a later processing step
            let filename = format!("{}-{}.jpeg", thread, record_id);
            (file_pointer(media.get("photo")), filename)
        }
        AttachmentKind::Poll => (poll_data(media), String::new()),
        AttachmentKind::Url => (
            media
                .get("web_preview")
                .and_then(|w| w.get("url"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            String::new(),
        ),
        _ => (String::new(), String::new()),
    }
}

/// Serialize the download pointer of a photo or video attachment.
fn file_pointer(attachment: Option<&Value>) -> String {
    let mut data = serde_json::Map::new();
    for field in ["id", "dc_id", "file_reference"] {
        data.insert(
            field.to_string(),
            attachment
                .and_then(|a| a.get(field))
                .cloned()
                .unwrap_or(Value::Null),
        );
    }
    Value::Object(data).to_string()
}

/// Serialize poll question, voter total and per-answer vote counts.
///
/// Vote counts are only reported upstream once somebody has voted; until
/// then every answer carries a `-1` sentinel, which keeps "no data yet"
/// distinguishable from "zero votes".
fn poll_data(media: &Value) -> String {
    let poll = media.get("poll");
    let results = media.get("results");

    let question = poll
        .and_then(|p| p.get("question"))
        .cloned()
        .unwrap_or(Value::String(String::new()));
    let voters = results
        .and_then(|r| r.get("total_voters"))
        .cloned()
        .unwrap_or(Value::Null);

    let mut options: Vec<(String, Value)> = Vec::new();
    if let Some(answers) = poll.and_then(|p| p.get("answers")).and_then(Value::as_array) {
        for answer in answers {
            let option = answer.get("option").map(option_key).unwrap_or_default();
            let text = answer
                .get("text")
                .cloned()
                .unwrap_or(Value::String(String::new()));
            options.push((option, text));
        }
    }

    let recorded = results
        .and_then(|r| r.get("results"))
        .and_then(Value::as_array)
        .filter(|rows| !rows.is_empty());

    let answers: Vec<Value> = match recorded {
        Some(rows) => rows
            .iter()
            .map(|row| {
                let option = row.get("option").map(option_key).unwrap_or_default();
                let text = options
                    .iter()
                    .find(|(key, _)| *key == option)
                    .map(|(_, text)| text.clone())
                    .unwrap_or(Value::String(String::new()));
                let votes = row.get("voters").cloned().unwrap_or(Value::from(-1));
                serde_json::json!({ "answer": text, "votes": votes })
            })
            .collect(),
        None => options
            .iter()
            .map(|(_, text)| serde_json::json!({ "answer": text, "votes": -1 }))
            .collect(),
    };

    serde_json::json!({ "question": question, "voters": voters, "answers": answers }).to_string()
}

/// Poll option keys are byte blobs upstream and hex strings once
/// flattened; anything else is keyed by its JSON rendering.
fn option_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Who and when a message was forwarded from, best effort.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ForwardOrigin {
    pub name: String,
    pub username: String,
    pub timestamp: Option<i64>,
}

/// Extract forward-origin information from a flattened message.
///
/// Forward information is spread out over several places upstream. In
/// order of usefulness we can identify a username, a full name, and a raw
/// id, not all of which are always available. Resolved-entity data is
/// consulted when present; otherwise unresolved identifiers are used.
pub fn resolve_forward_origin(message: &Value) -> ForwardOrigin {
    let mut origin = ForwardOrigin::default();

    let Some(fwd) = message.get("fwd_from").filter(|f| f.is_object()) else {
        return origin;
    };
    // a bare integer from_id carries nothing we can attribute
    let Some(from_id) = fwd.get("from_id").filter(|f| f.is_object()) else {
        return origin;
    };

    origin.timestamp = fwd.get("date").and_then(as_epoch);
    if let Some(name) = nonempty_str(fwd.get("from_name")) {
        origin.name = name;
    }

    if let Some(user) = from_id.get("user").filter(|u| u.is_object()) {
        // reference resolution was enabled and found a user
        if let Some(username) = nonempty_str(user.get("username")) {
            origin.username = username;
        }
        let mut full = String::new();
        if let Some(first) = nonempty_str(user.get("first_name")) {
            full.push_str(&first);
        }
        if let Some(last) = nonempty_str(user.get("last_name")) {
            if !full.is_empty() {
                full.push(' ');
            }
            full.push_str(&last);
        }
        if !full.is_empty() {
            origin.name = full;
        }
    } else if let Some(chats) = from_id.get("chats").and_then(Value::as_array) {
        // reference resolution was enabled and found a channel
        let channel_id = from_id.get("channel_id").and_then(Value::as_i64);
        for chat in chats {
            let matches = match channel_id {
                Some(id) => chat.get("id").and_then(Value::as_i64) == Some(id),
                None => true,
            };
            if matches {
                if let Some(username) = nonempty_str(chat.get("username")) {
                    origin.username = username;
                }
                break;
            }
        }
    }

    if origin.name.is_empty() && origin.username.is_empty() {
        if let Some(id) = from_id
            .get("channel_id")
            .or_else(|| from_id.get("user_id"))
            .and_then(Value::as_i64)
        {
            origin.name = id.to_string();
        }
    }

    origin
}

/// Assemble the canonical record for a flattened message.
///
/// Never fails: missing optional fields substitute empty strings or the
/// `unknown` default, and a message whose parent chat reference is
/// entirely absent gets the `error-no-chat`/`error-no-id` sentinels.
pub fn to_canonical_record(message: &Value) -> NormalizedRecord {
    let (thread, thread_num_id) = match message.get("_chat").filter(|c| c.is_object()) {
        None => ("error-no-chat".to_string(), "error-no-id".to_string()),
        Some(chat) => {
            // chats can apparently not have usernames, and some have no
            // title either
            let thread = if let Some(username) = nonempty_str(chat.get("username")) {
                username
            } else if let Some(title) = nonempty_str(chat.get("title")) {
                strip_whitespace(&title)
            } else {
                "unknown".to_string()
            };
            let num = chat
                .get("id")
                .and_then(Value::as_i64)
                .filter(|id| *id != 0)
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            (thread, num)
        }
    };

    // upstream responses only carry the sender id; username and names are
    // optional on top of that, and not every sender is a user at all
    let sender = message.get("_sender").filter(|s| s.is_object());
    let author = sender
        .and_then(|s| s.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();
    let author_is_bot = sender
        .map(|s| {
            s.get("bot")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                .to_string()
        })
        .unwrap_or_default();
    let author_username = sender
        .and_then(|s| nonempty_str(s.get("username")))
        .unwrap_or_default();
    let mut author_name = String::new();
    if let Some(first) = sender.and_then(|s| nonempty_str(s.get("first_name"))) {
        author_name.push_str(&first);
    }
    if let Some(last) = sender.and_then(|s| nonempty_str(s.get("last_name"))) {
        if !author_name.is_empty() {
            author_name.push(' ');
        }
        author_name.push_str(&last);
    }

    let id = message.get("id").and_then(Value::as_i64).unwrap_or(0);

    let null = Value::Null;
    let media = message.get("media").unwrap_or(&null);
    let kind = classify_attachment(media);
    let mut attachment_type = kind.as_str().to_string();
    if kind == AttachmentKind::Document {
        // the document subtype reclassifies the attachment to the MIME
        // top-level type, e.g. "audio" or "video"
        let mime = media
            .get("document")
            .and_then(|d| d.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if let Some(top) = mime.split('/').next().filter(|t| !t.is_empty()) {
            attachment_type = top.to_string();
        }
    }
    let (attachment_data, attachment_filename) =
        extract_attachment_data(kind, media, &thread, id);

    let forward = resolve_forward_origin(message);
    let date = message.get("date").and_then(as_epoch);
    let edit_date = message.get("edit_date").and_then(as_epoch);

    NormalizedRecord {
        id,
        thread_num_id,
        thread_id: thread,
        author,
        author_username,
        author_name,
        author_is_bot,
        body: message
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        reply_to: message
            .get("reply_to_msg_id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .unwrap_or_default(),
        views: message
            .get("views")
            .and_then(Value::as_i64)
            .filter(|v| *v != 0)
            .map(|v| v.to_string())
            .unwrap_or_default(),
        timestamp: date.map(format_timestamp).unwrap_or_default(),
        unix_timestamp: date.unwrap_or(0),
        timestamp_edited: edit_date.map(format_timestamp).unwrap_or_default(),
        unix_timestamp_edited: edit_date.map(|d| d.to_string()).unwrap_or_default(),
        author_forwarded_from_name: forward.name,
        author_forwarded_from_username: forward.username,
        timestamp_forwarded_from: forward.timestamp.map(format_timestamp).unwrap_or_default(),
        unix_timestamp_forwarded_from: forward
            .timestamp
            .map(|t| t.to_string())
            .unwrap_or_default(),
        attachment_type,
        attachment_data,
        attachment_filename,
    }
}

/// Epoch seconds from a flattened date field, tolerating float values.
fn as_epoch(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

fn format_timestamp(epoch: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn nonempty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn strip_whitespace(text: &str) -> String {
    match Regex::new(r"\s") {
        Ok(re) => re.replace_all(text, "").to_string(),
        Err(_) => text.to_string(),
    }
}
