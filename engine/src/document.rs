//! Document type stored in collections.
//!
//! A document carries typed metadata (id, creation and update stamps, owning
//! branch) plus a free-form bag of JSON fields. The bag keeps unknown fields
//! intact so older and newer application versions can share a store.

use crate::{error::Result, ActorId, BranchId, DocumentId, Error, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;

/// Name of the identifier field.
pub const ID_FIELD: &str = "_id";
/// Name of the creation timestamp field.
pub const CREATED_AT_FIELD: &str = "createdAt";
/// Name of the creator field.
pub const CREATED_BY_FIELD: &str = "createdBy";
/// Name of the owning-branch field.
pub const BRANCH_FIELD: &str = "branchId";
/// Name of the last-update timestamp field.
pub const UPDATED_AT_FIELD: &str = "updatedAt";
/// Name of the last-updater field.
pub const UPDATED_BY_FIELD: &str = "updatedBy";

/// Field names managed by the store. Callers may not set these directly
/// (except `_id` on insert).
pub const RESERVED_FIELDS: [&str; 6] = [
    ID_FIELD,
    CREATED_AT_FIELD,
    CREATED_BY_FIELD,
    BRANCH_FIELD,
    UPDATED_AT_FIELD,
    UPDATED_BY_FIELD,
];

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Unique identifier within the collection
    #[serde(rename = "_id")]
    pub id: DocumentId,
    /// When the document was inserted (milliseconds since epoch)
    pub created_at: Timestamp,
    /// Who inserted the document
    pub created_by: ActorId,
    /// Branch (tenant) owning the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<BranchId>,
    /// When the document was last updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
    /// Who last updated the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<ActorId>,
    /// Application fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Create a document from already-validated fields.
    pub fn new(
        id: impl Into<DocumentId>,
        fields: Map<String, Value>,
        created_at: Timestamp,
        created_by: impl Into<ActorId>,
        branch_id: Option<BranchId>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at,
            created_by: created_by.into(),
            branch_id,
            updated_at: None,
            updated_by: None,
            fields,
        }
    }

    /// Build a document from caller input.
    ///
    /// A string `_id` in the input is honored, otherwise `fallback_id` is used.
    /// Any other reserved metadata key is rejected.
    pub fn from_input(
        fallback_id: impl Into<DocumentId>,
        input: Value,
        created_at: Timestamp,
        created_by: impl Into<ActorId>,
        branch_id: Option<BranchId>,
    ) -> Result<Self> {
        let Value::Object(mut fields) = input else {
            return Err(Error::InvalidPayload("document must be an object".into()));
        };

        let id = match fields.remove(ID_FIELD) {
            None => fallback_id.into(),
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(other) => {
                return Err(Error::InvalidPayload(format!(
                    "_id must be a non-empty string, got {other}"
                )))
            }
        };

        if let Some(key) = fields.keys().find(|k| RESERVED_FIELDS.contains(&k.as_str())) {
            return Err(Error::InvalidPayload(format!(
                "field '{key}' is managed by the store"
            )));
        }

        Ok(Self::new(id, fields, created_at, created_by, branch_id))
    }

    /// Resolve a field by name or dotted path (`address.city`).
    ///
    /// Metadata fields resolve to owned values; application fields are
    /// borrowed.
    pub fn value_at(&self, path: &str) -> Option<Cow<'_, Value>> {
        match path {
            ID_FIELD => return Some(Cow::Owned(Value::String(self.id.clone()))),
            CREATED_AT_FIELD => return Some(Cow::Owned(Value::from(self.created_at))),
            CREATED_BY_FIELD => return Some(Cow::Owned(Value::String(self.created_by.clone()))),
            BRANCH_FIELD => return self.branch_id.clone().map(|b| Cow::Owned(Value::String(b))),
            UPDATED_AT_FIELD => return self.updated_at.map(|t| Cow::Owned(Value::from(t))),
            UPDATED_BY_FIELD => {
                return self.updated_by.clone().map(|u| Cow::Owned(Value::String(u)))
            }
            _ => {}
        }

        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(Cow::Borrowed(current))
    }

    /// Merge a patch into this document and stamp the update metadata.
    ///
    /// Top-level keys replace the existing value; dotted keys set a nested
    /// value, creating intermediate objects as needed. The patch is checked
    /// completely before anything is written.
    pub fn merge_patch(
        &mut self,
        patch: &Value,
        timestamp: Timestamp,
        actor: impl Into<ActorId>,
    ) -> Result<()> {
        let entries = Self::check_patch(patch)?;

        let mut fields = self.fields.clone();
        for (key, value) in entries {
            set_path(&mut fields, key, value.clone())?;
        }

        self.fields = fields;
        self.updated_at = Some(timestamp);
        self.updated_by = Some(actor.into());
        Ok(())
    }

    fn check_patch(patch: &Value) -> Result<&Map<String, Value>> {
        let entries = patch
            .as_object()
            .ok_or_else(|| Error::InvalidPatch("patch must be an object".into()))?;

        if entries.is_empty() {
            return Err(Error::InvalidPatch("patch is empty".into()));
        }

        for key in entries.keys() {
            if key.is_empty() || key.split('.').any(str::is_empty) {
                return Err(Error::InvalidPatch(format!("invalid field path '{key}'")));
            }
            let root = key.split('.').next().unwrap_or(key);
            if RESERVED_FIELDS.contains(&root) {
                return Err(Error::InvalidPatch(format!(
                    "field '{root}' is managed by the store"
                )));
            }
        }

        Ok(entries)
    }

    /// The application fields as a JSON object value.
    pub fn fields_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

fn set_path(fields: &mut Map<String, Value>, path: &str, value: Value) -> Result<()> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().unwrap_or(path);

    let mut current = fields;
    for segment in segments {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match slot {
            Value::Object(map) => map,
            _ => {
                return Err(Error::InvalidPatch(format!(
                    "cannot set '{path}': '{segment}' is not an object"
                )))
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}
