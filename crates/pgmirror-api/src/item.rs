//! Mirrored row representation

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::Value;

/// Column holding the stable row identity in mirrored tables
pub const IDENTITY_FIELD: &str = "_uuid";

/// Generate a fresh client-side row id (hyphenated UUID, no braces)
pub fn make_id() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

/// Strip the enclosing braces some clients put around UUID text
pub fn normalize_id(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed)
        .to_string()
}

/// One logical row of a mirrored table.
///
/// Owned by exactly one table manager; everybody else works on clones.
#[derive(Clone, Debug, Serialize)]
pub struct MirroredItem {
    id: String,
    created_at: DateTime<Utc>,
    fields: BTreeMap<String, Value>,
}

impl MirroredItem {
    /// New item with a client-generated id
    pub fn new() -> Self {
        Self::with_id(make_id())
    }

    pub fn with_id(id: impl AsRef<str>) -> Self {
        Self {
            id: normalize_id(id.as_ref()),
            created_at: Utc::now(),
            fields: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl AsRef<str>) {
        self.id = normalize_id(id.as_ref());
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }
}

impl Default for MirroredItem {
    fn default() -> Self {
        Self::new()
    }
}

// created_at is local bookkeeping and does not take part in equality
impl PartialEq for MirroredItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.fields == other.fields
    }
}
