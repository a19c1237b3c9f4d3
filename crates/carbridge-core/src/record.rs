//! Canonical records and their search projection

use serde::Serialize;
use serde_json::{Map, Value};

/// Business identifier field of a car record
pub const IDENTIFIER_FIELD: &str = "fzg_id";

/// Store bookkeeping fields that never reach the index
pub const STORE_PRIVATE_FIELDS: &[&str] = &["_id", "__v"];

/// Authoritative record as read from the document store
///
/// The field set is open; only the identifier field is guaranteed.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    fields: Map<String, Value>,
}

impl CanonicalRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Build from a JSON value; `None` unless the value is an object
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    /// Business identifier, if present as a string
    pub fn identifier(&self) -> Option<&str> {
        self.fields.get(IDENTIFIER_FIELD).and_then(Value::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Project into a fresh search document, dropping store-private fields
    pub fn project(&self) -> SearchDocument {
        let fields = self
            .fields
            .iter()
            .filter(|(key, _)| !STORE_PRIVATE_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        SearchDocument { fields }
    }
}

/// Index-ready projection of a [`CanonicalRecord`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SearchDocument {
    fields: Map<String, Value>,
}

impl SearchDocument {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> CanonicalRecord {
        CanonicalRecord::from_value(value).unwrap()
    }

    #[test]
    fn test_projection_strips_store_private_fields() {
        let rec = record(json!({
            "_id": "65a0f0c2e4b0a1b2c3d4e5f6",
            "__v": 3,
            "fzg_id": "X1",
            "color": "red",
            "updatedAt": "2024-01-12T10:00:00Z"
        }));

        let doc = rec.project();
        assert_eq!(
            doc.into_value(),
            json!({"fzg_id": "X1", "color": "red", "updatedAt": "2024-01-12T10:00:00Z"})
        );
    }

    #[test]
    fn test_projection_keeps_nested_shapes() {
        let rec = record(json!({
            "fzg_id": "X3",
            "owner": {"_id": "inner", "name": "A"},
            "tags": ["a", "b"]
        }));

        // only top-level bookkeeping is private
        let doc = rec.project();
        assert_eq!(doc.fields()["owner"], json!({"_id": "inner", "name": "A"}));
        assert_eq!(doc.len(), 3);
    }

    #[test]
    fn test_identifier() {
        assert_eq!(record(json!({"fzg_id": "X1"})).identifier(), Some("X1"));
        assert_eq!(record(json!({"fzg_id": 7})).identifier(), None);
        assert!(CanonicalRecord::from_value(json!("X1")).is_none());
    }

    #[test]
    fn test_document_serializes_as_plain_object() {
        let doc = record(json!({"_id": 1, "fzg_id": "X1"})).project();
        assert_eq!(serde_json::to_string(&doc).unwrap(), r#"{"fzg_id":"X1"}"#);
    }
}
