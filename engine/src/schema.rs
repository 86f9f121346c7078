//! Schema definition and validation.
//!
//! Schemas are registered when the store is initialized. They declare the
//! typed fields of each collection, its indexes, and whether one of its
//! fields holds sensitive data that must be encrypted at rest.

use crate::{error::Result, CollectionName, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// A declared index on one field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    /// Indexed field (dotted paths allowed)
    pub field: String,
    /// Whether values must be unique across live documents
    pub unique: bool,
}

/// Schema for a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection name
    pub name: CollectionName,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Declared indexes
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Field encrypted at rest, when the collection is sensitive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitive_field: Option<String>,
}

impl CollectionSchema {
    /// Create a new collection schema.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            indexes: Vec::new(),
            sensitive_field: None,
        }
    }

    /// Declare a unique index on `field`.
    pub fn with_unique(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(IndexDef {
            field: field.into(),
            unique: true,
        });
        self
    }

    /// Declare a non-unique lookup index on `field`.
    pub fn with_index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(IndexDef {
            field: field.into(),
            unique: false,
        });
        self
    }

    /// Mark `field` as the sensitive payload of this collection.
    pub fn with_sensitive(mut self, field: impl Into<String>) -> Self {
        self.sensitive_field = Some(field.into());
        self
    }

    /// Whether the collection stores sensitive data.
    pub fn is_sensitive(&self) -> bool {
        self.sensitive_field.is_some()
    }

    /// Validate document fields against this schema.
    ///
    /// Undeclared fields are accepted as-is.
    pub fn validate_fields(&self, fields: &Map<String, Value>) -> Result<()> {
        for field in &self.fields {
            field.validate(fields.get(&field.name))?;
        }
        Ok(())
    }

    /// Validate a JSON payload against this schema.
    pub fn validate_payload(&self, payload: &Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;
        self.validate_fields(obj)
    }
}

/// Version of the store schema.
///
/// Archives written under a different minor version can still be restored
/// (with a warning); a different major version cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Compare an archived schema version against this (live) version.
    pub fn compatibility(&self, archived: SchemaVersion) -> Compatibility {
        if archived.major != self.major {
            Compatibility::Incompatible
        } else if archived.minor != self.minor {
            Compatibility::MinorDrift
        } else {
            Compatibility::Exact
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Outcome of comparing two schema versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Exact,
    /// Same major version, different minor version
    MinorDrift,
    Incompatible,
}

/// Check that a collection or branch name is safe to use as a file name.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Schema for the entire store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for archive compatibility checks
    pub version: SchemaVersion,
    /// Collection schemas by name
    pub collections: HashMap<CollectionName, CollectionSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            collections: HashMap::new(),
        }
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    /// Get a collection schema by name.
    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Mark a registered collection as sensitive after the fact.
    ///
    /// Used when the set of sensitive collections comes from configuration.
    pub fn mark_sensitive(&mut self, collection: &str, field: impl Into<String>) -> Result<()> {
        let schema = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        schema.sensitive_field = Some(field.into());
        Ok(())
    }

    /// Names of all registered collections, sorted.
    pub fn collection_names(&self) -> Vec<CollectionName> {
        let mut names: Vec<_> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check every collection name.
    pub fn validate(&self) -> Result<()> {
        for name in self.collections.keys() {
            validate_name(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(SchemaVersion::new(1, 0)).with_collection(
            CollectionSchema::new(
                "users",
                vec![
                    FieldDef::required("username", FieldType::String),
                    FieldDef::required("age", FieldType::Int),
                    FieldDef::optional("email", FieldType::String),
                ],
            )
            .with_unique("username"),
        )
    }

    #[test]
    fn validate_valid_payload() {
        let schema = test_schema();
        let collection = schema.get_collection("users").unwrap();

        assert!(collection
            .validate_payload(&json!({"username": "alice", "age": 30}))
            .is_ok());
        assert!(collection
            .validate_payload(&json!({"username": "bob", "age": 25, "nickname": "b"}))
            .is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = test_schema();
        let collection = schema.get_collection("users").unwrap();

        let result = collection.validate_payload(&json!({"username": "alice"}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "age"));

        let result = collection.validate_payload(&json!({"username": null, "age": 3}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "username"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = test_schema();
        let collection = schema.get_collection("users").unwrap();

        let result = collection.validate_payload(&json!({"username": "alice", "age": "thirty"}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "age"));
    }

    #[test]
    fn json_field_accepts_any() {
        let collection =
            CollectionSchema::new("events", vec![FieldDef::required("data", FieldType::Json)]);

        for data in [json!("s"), json!(1), json!(true), json!([1]), json!({"a": 1})] {
            assert!(collection.validate_payload(&json!({ "data": data })).is_ok());
        }
    }

    #[test]
    fn version_compatibility() {
        let live = SchemaVersion::new(2, 1);
        assert_eq!(live.compatibility(SchemaVersion::new(2, 1)), Compatibility::Exact);
        assert_eq!(
            live.compatibility(SchemaVersion::new(2, 0)),
            Compatibility::MinorDrift
        );
        assert_eq!(
            live.compatibility(SchemaVersion::new(1, 1)),
            Compatibility::Incompatible
        );
        assert_eq!(live.to_string(), "2.1");
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("cash_sessions").is_ok());
        assert!(validate_name("branch-2").is_ok());
        assert!(validate_name("_changes").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn mark_sensitive_from_config() {
        let mut schema = test_schema();
        schema.mark_sensitive("users", "credentials").unwrap();
        assert_eq!(
            schema.get_collection("users").unwrap().sensitive_field.as_deref(),
            Some("credentials")
        );
        assert!(matches!(
            schema.mark_sensitive("ghosts", "x"),
            Err(Error::CollectionNotFound(_))
        ));
    }

    #[test]
    fn schema_serialization() {
        let schema = test_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
