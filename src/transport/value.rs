//! Tagged-variant representation of upstream API objects.
//!
//! The Telegram API layer hands back deeply nested, loosely typed structs.
//! Rather than probing attributes dynamically, transports translate every
//! object into this tree once, at the boundary. The normalizer then works
//! over the tree with explicit unknown-variant and missing-field rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Reserved key carrying the upstream type name of a flattened object.
pub const TYPE_KEY: &str = "_type";

/// A value obtained from the upstream API.
///
/// `Object` carries the origin type name of a known-domain struct (for
/// example `PeerChannel` or `MessageMediaPhoto`). `Opaque` marks a value of
/// a complex type the transport could not translate; flattening drops it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Date(DateTime<Utc>),
    List(Vec<RawValue>),
    Map(BTreeMap<String, RawValue>),
    Object {
        type_name: String,
        fields: BTreeMap<String, RawValue>,
    },
    Opaque(String),
}

impl RawValue {
    /// Build an origin-tagged object value.
    pub fn object<I>(type_name: &str, fields: I) -> RawValue
    where
        I: IntoIterator<Item = (&'static str, RawValue)>,
    {
        RawValue::Object {
            type_name: type_name.to_string(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    /// Build an untagged mapping value.
    pub fn map<I>(fields: I) -> RawValue
    where
        I: IntoIterator<Item = (&'static str, RawValue)>,
    {
        RawValue::Map(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// Look up a field on an object or mapping value.
    pub fn get(&self, key: &str) -> Option<&RawValue> {
        match self {
            RawValue::Map(fields) | RawValue::Object { fields, .. } => fields.get(key),
            _ => None,
        }
    }

    /// Convert an already-serialized JSON value back into the tree.
    ///
    /// Round-tripping through this conversion is what makes flattening
    /// idempotent: scalars, lists and mappings come back as themselves and
    /// nothing is tagged or dropped a second time.
    pub fn from_json(value: &serde_json::Value) -> RawValue {
        match value {
            serde_json::Value::Null => RawValue::Null,
            serde_json::Value::Bool(b) => RawValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RawValue::Int(i)
                } else {
                    RawValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => RawValue::Str(s.clone()),
            serde_json::Value::Array(items) => {
                RawValue::List(items.iter().map(RawValue::from_json).collect())
            }
            serde_json::Value::Object(fields) => RawValue::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), RawValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue::Int(v)
    }
}

impl From<bool> for RawValue {
    fn from(v: bool) -> Self {
        RawValue::Bool(v)
    }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        RawValue::Str(v.to_string())
    }
}

impl From<String> for RawValue {
    fn from(v: String) -> Self {
        RawValue::Str(v)
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(v: DateTime<Utc>) -> Self {
        RawValue::Date(v)
    }
}
