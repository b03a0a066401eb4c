//! Schema-less record model shared by every source format.
//!
//! A [`RawRecord`] is an ordered list of named [`RawValue`]s, each of which is a
//! [`Scalar`], a nested record, or a list. Tree sources keep attributes under
//! the reserved [`ATTR_SLOT`] and element text under [`TEXT_SLOT`] so the
//! conversion from markup stays lossless.
//!
//! Field order is preserved as read. [`RawRecord::canonical_json`] produces the
//! order-independent serialization used for content hashing and `raw_json`.

use std::fmt;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de,
    ser::{SerializeMap, SerializeSeq},
};
use serde_json::{Map, Number, Value as JsonValue};

pub const ATTR_SLOT: &str = "@";
pub const TEXT_SLOT: &str = "#text";
pub const VALUE_FIELD: &str = "value";

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
}

impl Scalar {
    /// Trimmed string form, `None` when null or blank.
    pub fn as_key_string(&self) -> Option<String> {
        let text = match self {
            Scalar::Null => return None,
            Scalar::Bool(b) => b.to_string(),
            Scalar::Number(n) => n.to_string(),
            Scalar::String(s) => s.trim().to_string(),
        };
        if text.is_empty() { None } else { Some(text) }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    fn to_json(&self) -> JsonValue {
        match self {
            Scalar::Null => JsonValue::Null,
            Scalar::Bool(b) => JsonValue::Bool(*b),
            Scalar::Number(n) => JsonValue::Number(n.clone()),
            Scalar::String(s) => JsonValue::String(s.clone()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "null"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::String(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::String(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Number(Number::from(value))
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Scalar(Scalar),
    Object(RawRecord),
    List(Vec<RawValue>),
}

impl RawValue {
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            RawValue::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&RawRecord> {
        match self {
            RawValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => RawValue::Scalar(Scalar::Null),
            JsonValue::Bool(b) => RawValue::Scalar(Scalar::Bool(b)),
            JsonValue::Number(n) => RawValue::Scalar(Scalar::Number(n)),
            JsonValue::String(s) => RawValue::Scalar(Scalar::String(s)),
            JsonValue::Array(items) => {
                RawValue::List(items.into_iter().map(RawValue::from_json).collect())
            }
            JsonValue::Object(map) => RawValue::Object(RawRecord::from_json_map(map)),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            RawValue::Scalar(s) => s.to_json(),
            RawValue::Object(o) => o.to_json(),
            RawValue::List(items) => JsonValue::Array(items.iter().map(RawValue::to_json).collect()),
        }
    }

    fn to_canonical_json(&self) -> JsonValue {
        match self {
            RawValue::Scalar(s) => s.to_json(),
            RawValue::Object(o) => o.to_canonical_value(),
            RawValue::List(items) => {
                JsonValue::Array(items.iter().map(RawValue::to_canonical_json).collect())
            }
        }
    }

    /// Compact JSON text of this value, field order preserved.
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }
}

impl From<Scalar> for RawValue {
    fn from(value: Scalar) -> Self {
        RawValue::Scalar(value)
    }
}

impl From<RawRecord> for RawValue {
    fn from(value: RawRecord) -> Self {
        RawValue::Object(value)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRecord {
    fields: Vec<(String, RawValue)>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a non-object value as `{"value": ...}`.
    pub fn wrap_value(value: RawValue) -> Self {
        let mut record = Self::new();
        record.insert(VALUE_FIELD, value);
        record
    }

    /// Object values become records directly; anything else is wrapped.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => Self::from_json_map(map),
            other => Self::wrap_value(RawValue::from_json(other)),
        }
    }

    fn from_json_map(map: Map<String, JsonValue>) -> Self {
        Self {
            fields: map
                .into_iter()
                .map(|(k, v)| (k, RawValue::from_json(v)))
                .collect(),
        }
    }

    /// Replaces an existing field in place or appends a new one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<RawValue>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.fields.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&RawValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Exact match first, then the first case-insensitive match.
    pub fn get_ci(&self, key: &str) -> Option<&RawValue> {
        self.get(key).or_else(|| {
            self.fields
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn attributes(&self) -> Option<&RawRecord> {
        self.get(ATTR_SLOT).and_then(RawValue::as_object)
    }

    pub fn attribute(&self, name: &str) -> Option<&Scalar> {
        self.attributes()
            .and_then(|attrs| attrs.get(name))
            .and_then(RawValue::as_scalar)
    }

    pub fn text(&self) -> Option<&Scalar> {
        self.get(TEXT_SLOT).and_then(RawValue::as_scalar)
    }

    /// True when the only fields are the text slot and, optionally, the attribute slot.
    pub fn is_text_node(&self) -> bool {
        self.contains_key(TEXT_SLOT)
            && self.keys().all(|k| k == TEXT_SLOT || k == ATTR_SLOT)
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::with_capacity(self.fields.len());
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.to_json());
        }
        JsonValue::Object(map)
    }

    fn to_canonical_value(&self) -> JsonValue {
        let mut sorted: Vec<&(String, RawValue)> = self.fields.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut map = Map::with_capacity(sorted.len());
        for (k, v) in sorted {
            map.insert(k.clone(), v.to_canonical_json());
        }
        JsonValue::Object(map)
    }

    /// Deterministic serialization: keys sorted at every level, compact separators.
    pub fn canonical_json(&self) -> String {
        self.to_canonical_value().to_string()
    }

    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }
}

impl FromIterator<(String, RawValue)> for RawRecord {
    fn from_iter<T: IntoIterator<Item = (String, RawValue)>>(iter: T) -> Self {
        let mut record = RawRecord::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Null => serializer.serialize_unit(),
            Scalar::Bool(b) => serializer.serialize_bool(*b),
            Scalar::Number(n) => n.serialize(serializer),
            Scalar::String(s) => serializer.serialize_str(s),
        }
    }
}

impl Serialize for RawValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RawValue::Scalar(s) => s.serialize(serializer),
            RawValue::Object(o) => o.serialize(serializer),
            RawValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl Serialize for RawRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RawValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(RawValue::from_json)
    }
}

impl<'de> Deserialize<'de> for RawRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match JsonValue::deserialize(deserializer)? {
            JsonValue::Object(map) => Ok(RawRecord::from_json_map(map)),
            other => Err(de::Error::custom(format!(
                "expected a JSON object for a record, found {other}"
            ))),
        }
    }
}
