//! Per-domain strategies the engine is parameterized over
//!
//! A domain (lawyers, payments, calendar deadlines, ...) tells the engine
//! where the natural key lives, how external fields map onto stored fields
//! and how two field values are compared. The engine itself knows nothing
//! about any particular domain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ReconcileError, Result};
use crate::record::{ExternalRecord, FieldMap};

/// Capability set for one entity domain
pub trait ReconcileDomain: Send + Sync {
    /// Domain name, also the key for run locks and report labels
    fn name(&self) -> &str;

    /// Raw natural key of an external record, `None` when absent
    fn natural_key<'a>(&self, record: &'a ExternalRecord) -> Option<&'a str>;

    /// External record mapped onto the local field layout
    fn project(&self, record: &ExternalRecord) -> FieldMap;

    /// Whether an external and a local value of `field` are equal
    fn fields_equal(&self, _field: &str, external: &Value, local: &Value) -> bool {
        external == local
    }

    /// Like [`natural_key`](Self::natural_key) but an error when missing
    fn require_key<'a>(&self, record: &'a ExternalRecord) -> Result<&'a str> {
        self.natural_key(record).ok_or_else(|| {
            ReconcileError::invalid_key(format!(
                "external record in domain '{}' has no natural key",
                self.name()
            ))
        })
    }
}

/// Domain described entirely by configuration.
///
/// ```toml
/// name = "lawyers"
/// key_field = "email"
/// case_insensitive_fields = ["email"]
///
/// [fields]
/// email = "email"
/// firm = "law_firm"
/// practiceAreas = "practice_areas"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMappingDomain {
    pub name: String,
    /// External field holding the natural key
    pub key_field: String,
    /// External field name to local field name; empty copies every field
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Local fields whose string values compare case-insensitively
    #[serde(default)]
    pub case_insensitive_fields: Vec<String>,
}

impl FieldMappingDomain {
    /// Domain that copies every external field unchanged
    pub fn passthrough(name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: key_field.into(),
            fields: BTreeMap::new(),
            case_insensitive_fields: Vec::new(),
        }
    }

    pub fn map_field(mut self, external: impl Into<String>, local: impl Into<String>) -> Self {
        self.fields.insert(external.into(), local.into());
        self
    }

    pub fn case_insensitive(mut self, local_field: impl Into<String>) -> Self {
        self.case_insensitive_fields.push(local_field.into());
        self
    }
}

impl ReconcileDomain for FieldMappingDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn natural_key<'a>(&self, record: &'a ExternalRecord) -> Option<&'a str> {
        record.get_str(&self.key_field)
    }

    fn require_key<'a>(&self, record: &'a ExternalRecord) -> Result<&'a str> {
        match record.get(&self.key_field) {
            Some(Value::String(key)) => Ok(key.as_str()),
            Some(other) => Err(ReconcileError::invalid_key(format!(
                "key field '{}' in domain '{}' is not a string: {}",
                self.key_field, self.name, other
            ))),
            None => Err(ReconcileError::invalid_key(format!(
                "external record in domain '{}' has no '{}' field",
                self.name, self.key_field
            ))),
        }
    }

    fn project(&self, record: &ExternalRecord) -> FieldMap {
        if self.fields.is_empty() {
            return record.fields.clone();
        }

        // Fields absent upstream are left out, not nulled
        self.fields
            .iter()
            .filter_map(|(external, local)| {
                record
                    .get(external)
                    .map(|value| (local.clone(), value.clone()))
            })
            .collect()
    }

    fn fields_equal(&self, field: &str, external: &Value, local: &Value) -> bool {
        if self.case_insensitive_fields.iter().any(|f| f == field) {
            if let (Some(a), Some(b)) = (external.as_str(), local.as_str()) {
                return a.trim().to_lowercase() == b.trim().to_lowercase();
            }
        }
        external == local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lawyer() -> ExternalRecord {
        ExternalRecord::from_json(json!({
            "id": "lf-lawyer-1",
            "email": "Max.Mustermann@lawfirm.de",
            "firm": "Mustermann & Partner",
            "practiceAreas": ["Mietrecht", "Arbeitsrecht"]
        }))
        .unwrap()
    }

    #[test]
    fn test_passthrough_projects_all_fields() {
        let domain = FieldMappingDomain::passthrough("lawyers", "email");
        let projected = domain.project(&lawyer());
        assert_eq!(projected.len(), 4);
        assert_eq!(domain.natural_key(&lawyer()), Some("Max.Mustermann@lawfirm.de"));
    }

    #[test]
    fn test_mapping_renames_and_drops_unmapped() {
        let domain = FieldMappingDomain::passthrough("lawyers", "email")
            .map_field("email", "email")
            .map_field("firm", "law_firm")
            .map_field("regions", "regions");

        let projected = domain.project(&lawyer());
        assert_eq!(projected.get("law_firm"), Some(&json!("Mustermann & Partner")));
        assert!(!projected.contains_key("firm"));
        assert!(!projected.contains_key("id"));
        // regions is mapped but missing upstream
        assert!(!projected.contains_key("regions"));
    }

    #[test]
    fn test_case_insensitive_fields() {
        let domain = FieldMappingDomain::passthrough("lawyers", "email").case_insensitive("email");
        assert!(domain.fields_equal("email", &json!("A@B.de"), &json!("a@b.de ")));
        assert!(!domain.fields_equal("name", &json!("A"), &json!("a")));
    }

    #[test]
    fn test_require_key_missing() {
        let domain = FieldMappingDomain::passthrough("payments", "reference");
        let err = domain.require_key(&lawyer()).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidKey { .. }));
    }

    #[test]
    fn test_require_key_reports_non_string_key() {
        let domain = FieldMappingDomain::passthrough("payments", "invoice");
        let payment = ExternalRecord::from_json(json!({"invoice": 1042, "amount": "99.00"})).unwrap();

        let err = domain.require_key(&payment).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidKey { .. }));
        let message = err.to_string();
        assert!(message.contains("'invoice'"), "{}", message);
        assert!(message.contains("not a string"), "{}", message);
        assert!(message.contains("1042"), "{}", message);
    }

    #[test]
    fn test_deserialize_from_toml_shape() {
        let domain: FieldMappingDomain = serde_json::from_value(json!({
            "name": "deadlines",
            "key_field": "case_number",
            "fields": {"case_number": "case_number", "deadline": "due_at"}
        }))
        .unwrap();
        assert_eq!(domain.fields.len(), 2);
        assert!(domain.case_insensitive_fields.is_empty());
    }
}
