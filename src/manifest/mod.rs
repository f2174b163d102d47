//! Manifest value model.
//!
//! A manifest is a schema-less mapping produced upstream. It is held as a
//! tagged recursive value whose maps keep their keys sorted, so the
//! canonical form (see [`canonical`]) is well-defined and total apart from
//! non-finite floats.

pub mod canonical;

use std::collections::BTreeMap;

use crate::error::{ProvenanceError, Result};

pub use canonical::{canonicalize, digest, CanonicalBytes};

/// Top-level keys a seal stamps onto a manifest. A sealed manifest's
/// drift hash is taken with them removed.
pub const META_FIELDS: [&str; 3] = ["expected_sha256", "version", "hash_algorithm"];

/// A JSON-compatible manifest value.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Integers above `i64::MAX`.
    UInt(u64),
    Float(f64),
    String(String),
    List(Vec<ManifestValue>),
    Map(BTreeMap<String, ManifestValue>),
}

impl From<serde_json::Value> for ManifestValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&str> for ManifestValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ManifestValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for ManifestValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for ManifestValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for ManifestValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<Vec<ManifestValue>> for ManifestValue {
    fn from(items: Vec<ManifestValue>) -> Self {
        Self::List(items)
    }
}

/// A manifest: string keys mapped to [`ManifestValue`]s.
///
/// Identity is the canonical byte form, not insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestValue>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document whose top level must be an object.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| ProvenanceError::InvalidInput(format!("manifest is not valid JSON: {e}")))?;
        Self::try_from(value)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ManifestValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ManifestValue> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ManifestValue> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, ManifestValue> {
        &self.entries
    }

    /// Copy of this manifest without the [`META_FIELDS`].
    pub fn without_meta(&self) -> Self {
        let mut stripped = self.clone();
        for key in META_FIELDS {
            stripped.entries.remove(key);
        }
        stripped
    }

    /// Canonical JSON text of this manifest.
    pub fn to_canonical_string(&self) -> Result<String> {
        let bytes = canonicalize(self)?;
        String::from_utf8(bytes.into_vec()).map_err(|e| ProvenanceError::UnserializableValue {
            path: "$".into(),
            reason: e.to_string(),
        })
    }

    /// Converts to a `serde_json::Value` for display or transport.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let text = self.to_canonical_string()?;
        serde_json::from_str(&text)
            .map_err(|e| ProvenanceError::InvalidInput(format!("canonical form did not reparse: {e}")))
    }
}

impl TryFrom<serde_json::Value> for Manifest {
    type Error = ProvenanceError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        match ManifestValue::from(value) {
            ManifestValue::Map(entries) => Ok(Self { entries }),
            _ => Err(ProvenanceError::InvalidInput(
                "manifest must be a JSON object at the top level".into(),
            )),
        }
    }
}

impl FromIterator<(String, ManifestValue)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (String, ManifestValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
