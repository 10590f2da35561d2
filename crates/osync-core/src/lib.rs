//! Core record model shared by parsers, the reconciler and the store adapters.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod reconcile;

pub use reconcile::{
    reconcile, ChangeSummary, DiffResult, Disposition, FieldChange, MergedEntry, ReconcileError,
    ReconcilePolicy,
};

pub const CRATE_NAME: &str = "osync-core";

/// One named attribute value. Non-scalar values only ever come from the store
/// and are carried through merges untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Json(JsonValue),
}

impl FieldValue {
    /// Converts a stored JSON value; `null` and blank text are absent.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => None,
            JsonValue::Bool(b) => Some(Self::Bool(*b)),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Integer(i)),
                None => n.as_f64().map(Self::Float),
            },
            JsonValue::String(s) => text_or_none(s).map(Self::Text),
            JsonValue::Array(_) | JsonValue::Object(_) => Some(Self::Json(value.clone())),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Integer(i) => JsonValue::from(*i),
            Self::Float(f) => JsonValue::from(*f),
            Self::Text(s) => JsonValue::String(s.clone()),
            Self::Json(v) => v.clone(),
        }
    }

    pub fn is_absent(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            Self::Json(v) => v.is_null(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// A freshly parsed external entity. Absent values are never stored, so a
/// missing field always means "the parser found nothing".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style setter; `None` and blank values are dropped.
    pub fn with<V: Into<FieldValue>>(mut self, name: &str, value: Option<V>) -> Self {
        if let Some(value) = value.map(Into::into) {
            if !value.is_absent() {
                self.fields.insert(name.to_string(), value);
            }
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    /// JSON object form with the key written back under `key_field`.
    pub fn to_document(&self, key_field: &str) -> JsonValue {
        let mut object = Map::new();
        object.insert(key_field.to_string(), JsonValue::String(self.key.clone()));
        for (name, value) in &self.fields {
            object.insert(name.clone(), value.to_json());
        }
        JsonValue::Object(object)
    }

    /// JSON object form without the key (map-shaped collections carry the key
    /// as the map entry name).
    pub fn fields_document(&self) -> JsonValue {
        JsonValue::Object(
            self.fields
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}

/// Deterministic key of a newspaper issue (`YYYYRR`).
pub fn composite_key(year: i64, release: i64) -> i64 {
    year * 100 + release
}

/// A stored entry that could not be turned into a [`StoredRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedEntry {
    pub position: String,
    pub reason: String,
}

/// Persisted counterpart of a [`Record`], including fields only the store knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl StoredRecord {
    /// Decodes one element of an array-shaped collection whose key lives in
    /// `key_field`.
    pub fn from_document(
        position: usize,
        value: &JsonValue,
        key_field: &str,
    ) -> Result<Self, MalformedEntry> {
        let malformed = |reason: &str| MalformedEntry {
            position: position.to_string(),
            reason: reason.to_string(),
        };
        let object = value.as_object().ok_or_else(|| malformed("entry is not an object"))?;
        let key = object
            .get(key_field)
            .and_then(FieldValue::from_json)
            .and_then(|v| key_text(&v))
            .ok_or_else(|| malformed(&format!("missing key field `{key_field}`")))?;
        let fields = object
            .iter()
            .filter(|(name, _)| name.as_str() != key_field)
            .filter_map(|(name, v)| FieldValue::from_json(v).map(|v| (name.clone(), v)))
            .collect();
        Ok(Self { key, fields })
    }

    /// Decodes one entry of a map-shaped collection keyed by `key`.
    pub fn from_keyed_document(key: &str, value: &JsonValue) -> Result<Self, MalformedEntry> {
        let object = value.as_object().ok_or_else(|| MalformedEntry {
            position: key.to_string(),
            reason: "entry is not an object".to_string(),
        })?;
        Ok(Self {
            key: key.to_string(),
            fields: object
                .iter()
                .filter_map(|(name, v)| FieldValue::from_json(v).map(|v| (name.clone(), v)))
                .collect(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// True when the provenance flag marks the record as coming from the website.
    pub fn is_externally_sourced(&self, provenance_field: &str) -> bool {
        self.get(provenance_field).and_then(FieldValue::as_bool) == Some(true)
    }
}

impl From<Record> for StoredRecord {
    fn from(record: Record) -> Self {
        Self {
            key: record.key,
            fields: record.fields,
        }
    }
}

fn key_text(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Text(s) => Some(s.clone()),
        FieldValue::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Previously stored records in store order, indexed by key.
#[derive(Debug, Clone, Default)]
pub struct StoredCollection {
    records: Vec<StoredRecord>,
    index: BTreeMap<String, usize>,
    pub skipped: Vec<MalformedEntry>,
}

impl StoredCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A repeated stored key replaces the earlier record in place; the
    /// replaced one is reported in `skipped`.
    pub fn push(&mut self, record: StoredRecord) {
        match self.index.get(&record.key) {
            Some(&slot) => {
                self.skipped.push(MalformedEntry {
                    position: record.key.clone(),
                    reason: "duplicate stored key, keeping the last one".to_string(),
                });
                self.records[slot] = record;
            }
            None => {
                self.index.insert(record.key.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = StoredRecord>) -> Self {
        let mut collection = Self::new();
        for record in records {
            collection.push(record);
        }
        collection
    }

    /// Array-shaped collection (`[null, {...}, {...}]`). Null slots, such as the
    /// leading sentinel, are ignored; other unusable entries are recorded as skipped.
    pub fn from_array(value: Option<&JsonValue>, key_field: &str) -> Self {
        let mut collection = Self::new();
        let Some(value) = value else {
            return collection;
        };
        let mut entries: Vec<(usize, &JsonValue)> = match value {
            JsonValue::Array(items) => items.iter().enumerate().collect(),
            // Sparse arrays come back from the realtime DB as objects keyed by index.
            JsonValue::Object(map) => map
                .iter()
                .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
                .collect(),
            JsonValue::Null => Vec::new(),
            other => {
                collection.skipped.push(MalformedEntry {
                    position: "<root>".to_string(),
                    reason: format!("expected an array, found {other}"),
                });
                Vec::new()
            }
        };
        // Object keys arrive string-sorted ("10" before "2").
        entries.sort_by_key(|(position, _)| *position);
        for (position, entry) in entries {
            if entry.is_null() {
                continue;
            }
            match StoredRecord::from_document(position, entry, key_field) {
                Ok(record) => collection.push(record),
                Err(bad) => collection.skipped.push(bad),
            }
        }
        collection
    }

    /// Map-shaped collection (`{"202401": {...}}`).
    pub fn from_map(value: Option<&JsonValue>) -> Self {
        let mut collection = Self::new();
        match value {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::Object(map)) => {
                for (key, entry) in map {
                    match StoredRecord::from_keyed_document(key, entry) {
                        Ok(record) => collection.push(record),
                        Err(bad) => collection.skipped.push(bad),
                    }
                }
            }
            Some(other) => collection.skipped.push(MalformedEntry {
                position: "<root>".to_string(),
                reason: format!("expected an object, found {other}"),
            }),
        }
        collection
    }

    pub fn get(&self, key: &str) -> Option<&StoredRecord> {
        self.index.get(key).map(|&slot| &self.records[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
