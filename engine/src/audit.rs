//! Audit log: who did what, for compliance reporting.
//!
//! Unlike the change log this records one entry per call, not per document,
//! and also covers operations that never touch documents (backups, branch
//! switches). It plays no part in replication.

use crate::{ActorId, BranchId, CollectionName, DocumentId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditAction {
    Insert,
    Update,
    Remove,
    BackupCreated,
    Restored,
    BranchSwitched,
    /// A sensitive collection was opened without an encryption key
    PlaintextSensitive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    #[serde(rename = "_id")]
    pub id: u64,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionName>,
    #[serde(default)]
    pub document_ids: Vec<DocumentId>,
    pub actor: ActorId,
    pub branch_id: BranchId,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = AuditEntry>) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by_key(|e| (e.timestamp, e.id));
        Self { entries }
    }

    pub fn append(&mut self, entry: AuditEntry) {
        self.entries.push(entry);
    }

    /// Entries in the order they were recorded.
    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn for_collection<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a AuditEntry> {
        self.entries
            .iter()
            .filter(move |e| e.collection.as_deref() == Some(collection))
    }

    pub fn max_id(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.id).max()
    }

    /// Drop an entry whose mutation was undone.
    pub fn discard(&mut self, id: u64) {
        self.entries.retain(|e| e.id != id);
    }

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

    fn entry(id: u64, action: AuditAction, collection: Option<&str>) -> AuditEntry {
        AuditEntry {
            id,
            action,
            collection: collection.map(Into::into),
            document_ids: vec![],
            actor: "manager".into(),
            branch_id: "main".into(),
            timestamp: id * 10,
            detail: None,
        }
    }

    #[test]
    fn filter_by_collection() {
        let mut log = AuditLog::new();
        log.append(entry(1, AuditAction::Insert, Some("invoices")));
        log.append(entry(2, AuditAction::BackupCreated, None));
        log.append(entry(3, AuditAction::Remove, Some("invoices")));

        assert_eq!(log.for_collection("invoices").count(), 2);
        assert_eq!(log.max_id(), Some(3));

        log.discard(3);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn action_wire_names() {
        let mut e = entry(1, AuditAction::BackupCreated, None);
        e.detail = Some(json!({"archive": "daily-1.tly"}));
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["action"], "backupCreated");
        assert!(value.get("collection").is_none());
        assert_eq!(value["detail"]["archive"], "daily-1.tly");

        let parsed: AuditEntry = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn loading_orders_entries() {
        let log = AuditLog::from_entries(vec![
            entry(2, AuditAction::Update, None),
            entry(1, AuditAction::Insert, None),
        ]);
        assert_eq!(log.entries()[0].id, 1);
    }
}
