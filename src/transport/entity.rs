//! Entity identifiers.
//!
//! Queries arrive as free-form strings: usernames, `t.me` links, numeric
//! channel ids. They are normalized into a sum type once, at this boundary,
//! instead of re-parsing strings throughout the collection loop.

use std::fmt;

use regex::Regex;

/// An addressable channel, group, or user in the upstream messaging system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    /// Public username, without any `@` or URL decoration.
    Username(String),
    /// Numeric peer id, used for chats without a public username.
    NumericId(i64),
}

impl EntityRef {
    /// Parse a raw identifier string.
    ///
    /// Strips `https://t.me/` prefixes, `/s/` web-view path segments and
    /// trailing slashes, then coerces purely numeric identifiers (with an
    /// optional leading `-` for channel-style ids). Returns `None` for
    /// strings that are empty after sanitization.
    pub fn parse(raw: &str) -> Option<EntityRef> {
        let mut item = raw.trim().to_string();
        if let Ok(re) = Regex::new(r"^https?://t\.me/") {
            item = re.replace(&item, "").to_string();
        }
        if let Ok(re) = Regex::new(r"^/?s/") {
            item = re.replace(&item, "").to_string();
        }
        if let Ok(re) = Regex::new(r"/*$") {
            item = re.replace(&item, "").to_string();
        }
        let item = item.trim_start_matches('@').trim();
        if item.is_empty() {
            return None;
        }

        match item.parse::<i64>() {
            Ok(id) => Some(EntityRef::NumericId(id)),
            Err(_) => Some(EntityRef::Username(item.to_string())),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Username(name) => write!(f, "{}", name),
            EntityRef::NumericId(id) => write!(f, "{}", id),
        }
    }
}
