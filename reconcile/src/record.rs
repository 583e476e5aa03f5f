//! External and local record types

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field name to value mapping. Ordered so serialization is canonical.
pub type FieldMap = BTreeMap<String, Value>;

/// Surrogate identifier assigned by the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LocalId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A record as delivered by an external system
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalRecord {
    pub fields: FieldMap,
}

impl ExternalRecord {
    pub fn new(fields: FieldMap) -> Self {
        Self { fields }
    }

    /// Build a record from a JSON object; anything else yields `None`
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self {
                fields: map.into_iter().collect(),
            }),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String value of a field, if the field holds a string
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

impl FromIterator<(String, Value)> for ExternalRecord {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// A record persisted in the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: LocalId,
    /// Natural key mirroring the external one, stored un-normalized
    pub natural_key: String,
    /// Field snapshot used for change detection
    #[serde(default)]
    pub fields: FieldMap,
    /// Hash of `fields` as last written by reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl LocalRecord {
    pub fn new(id: impl Into<LocalId>, natural_key: impl Into<String>, fields: FieldMap) -> Self {
        let content_hash = Some(content_hash(&fields));
        Self {
            id: id.into(),
            natural_key: natural_key.into(),
            fields,
            content_hash,
        }
    }
}

/// Payload handed to the store when creating a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub natural_key: String,
    pub fields: FieldMap,
    pub content_hash: String,
}

/// BLAKE3 hex digest of the canonical JSON encoding of `fields`
pub fn content_hash(fields: &FieldMap) -> String {
    let bytes = serde_json::to_vec(fields).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_object() {
        let record = ExternalRecord::from_json(json!({"email": "a@b.de", "name": "Müller"})).unwrap();
        assert_eq!(record.get_str("email"), Some("a@b.de"));
        assert!(ExternalRecord::from_json(json!(["not", "an", "object"])).is_none());
    }

    #[test]
    fn test_content_hash_ignores_insertion_order() {
        let mut a = FieldMap::new();
        a.insert("name".into(), json!("Müller"));
        a.insert("firm".into(), json!("Mustermann & Partner"));

        let mut b = FieldMap::new();
        b.insert("firm".into(), json!("Mustermann & Partner"));
        b.insert("name".into(), json!("Müller"));

        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_content_hash_changes_with_value() {
        let mut a = FieldMap::new();
        a.insert("name".into(), json!("Müller"));
        let mut b = a.clone();
        b.insert("name".into(), json!("Müller-Schmidt"));
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_local_record_serializes_id_as_number() {
        let record = LocalRecord::new(7, "a1", FieldMap::new());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["natural_key"], json!("a1"));
    }
}
