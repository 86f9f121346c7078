//! Field indexes.
//!
//! An index maps the canonical JSON encoding of a field value to the ids of
//! the documents holding it. Indexes are sparse: a document without the
//! field, or with `null` in it, is not indexed.

use crate::{Document, DocumentId};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Canonical key for an indexed value.
///
/// Whole numbers are normalized so `2` and `2.0` collide.
pub fn index_key(value: &Value) -> String {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Index over one field of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldIndex {
    field: String,
    unique: bool,
    entries: HashMap<String, BTreeSet<DocumentId>>,
}

impl FieldIndex {
    pub fn new(field: impl Into<String>, unique: bool) -> Self {
        Self {
            field: field.into(),
            unique,
            entries: HashMap::new(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// The key this index stores `doc` under, if any.
    pub fn key_for(&self, doc: &Document) -> Option<String> {
        match doc.value_at(&self.field) {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => Some(index_key(&v)),
        }
    }

    /// The id of another document that would collide with `doc`.
    ///
    /// Always `None` for non-unique indexes.
    pub fn conflict(&self, doc: &Document) -> Option<(&DocumentId, String)> {
        if !self.unique {
            return None;
        }
        let key = self.key_for(doc)?;
        let ids = self.entries.get(&key)?;
        ids.iter().find(|id| **id != doc.id).map(|id| (id, key))
    }

    pub fn insert(&mut self, doc: &Document) {
        if let Some(key) = self.key_for(doc) {
            self.entries.entry(key).or_default().insert(doc.id.clone());
        }
    }

    pub fn remove(&mut self, doc: &Document) {
        if let Some(key) = self.key_for(doc) {
            if let Some(ids) = self.entries.get_mut(&key) {
                ids.remove(&doc.id);
                if ids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Ids of documents whose field equals `value`.
    pub fn lookup(&self, value: &Value) -> Vec<DocumentId> {
        if value.is_null() {
            return Vec::new();
        }
        self.entries
            .get(&index_key(value))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of distinct indexed values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: &str, username: Value) -> Document {
        Document::from_input(id, json!({ "username": username }), 1, "t", None).unwrap()
    }

    #[test]
    fn unique_conflict_detection() {
        let mut index = FieldIndex::new("username", true);
        let alice = user("u1", json!("alice"));
        index.insert(&alice);

        let dup = user("u2", json!("alice"));
        let (id, key) = index.conflict(&dup).unwrap();
        assert_eq!(id, "u1");
        assert_eq!(key, "\"alice\"");

        // the same document never conflicts with itself
        assert!(index.conflict(&alice).is_none());
        assert!(index.conflict(&user("u3", json!("bob"))).is_none());
    }

    #[test]
    fn sparse_index_skips_null_and_missing() {
        let mut index = FieldIndex::new("username", true);
        index.insert(&user("u1", json!(null)));
        index.insert(&user("u2", json!(null)));
        let missing = Document::from_input("u3", json!({}), 1, "t", None).unwrap();
        index.insert(&missing);

        assert!(index.is_empty());
        assert!(index.conflict(&user("u4", json!(null))).is_none());
    }

    #[test]
    fn non_unique_index_never_conflicts() {
        let mut index = FieldIndex::new("status", false);
        let a = Document::from_input("a", json!({"status": "paid"}), 1, "t", None).unwrap();
        let b = Document::from_input("b", json!({"status": "paid"}), 1, "t", None).unwrap();
        index.insert(&a);
        assert!(index.conflict(&b).is_none());
        index.insert(&b);
        assert_eq!(index.lookup(&json!("paid")), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn remove_drops_empty_keys() {
        let mut index = FieldIndex::new("username", true);
        let alice = user("u1", json!("alice"));
        index.insert(&alice);
        index.remove(&alice);
        assert!(index.is_empty());
        assert!(index.lookup(&json!("alice")).is_empty());
    }

    #[test]
    fn numeric_keys_are_normalized() {
        assert_eq!(index_key(&json!(2)), index_key(&json!(2.0)));
        assert_ne!(index_key(&json!(2)), index_key(&json!("2")));
    }
}
