//! Logical snapshot of the store.
//!
//! Snapshots are the bridge between the in-memory Store and backup archives.
//! They hold plaintext documents of the user collections only; the change log
//! and audit log are local bookkeeping and are never archived.

use crate::{
    error::Result, BranchId, CollectionName, Document, DocumentId, Error, NodeId, SchemaVersion,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of some or all collections.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    /// Branch the documents were read from
    pub branch_id: BranchId,
    /// Node that produced the snapshot
    pub node_id: NodeId,
    pub created_at: Timestamp,
    /// Documents organized by collection, then by id
    pub collections: BTreeMap<CollectionName, BTreeMap<DocumentId, Document>>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(
        schema_version: SchemaVersion,
        branch_id: impl Into<BranchId>,
        node_id: impl Into<NodeId>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            branch_id: branch_id.into(),
            node_id: node_id.into(),
            created_at,
            collections: BTreeMap::new(),
        }
    }

    /// Add an (empty) collection to the snapshot.
    pub fn add_collection(&mut self, name: impl Into<CollectionName>) {
        self.collections.entry(name.into()).or_default();
    }

    /// Add a document to a collection of the snapshot.
    pub fn add_document(&mut self, collection: &str, doc: Document) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(doc.id.clone(), doc);
    }

    pub fn get_document(&self, collection: &str, id: &str) -> Option<&Document> {
        self.collections.get(collection)?.get(id)
    }

    pub fn collection_names(&self) -> Vec<CollectionName> {
        self.collections.keys().cloned().collect()
    }

    /// Count documents across all collections.
    pub fn document_count(&self) -> usize {
        self.collections.values().map(|c| c.len()).sum()
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            format_version: self.format_version,
            schema_version: self.schema_version,
            branch_id: self.branch_id.clone(),
            created_at: self.created_at,
            collections: self
                .collections
                .iter()
                .map(|(name, docs)| (name.clone(), docs.len()))
                .collect(),
            document_count: self.document_count(),
        }
    }

    /// Serialize to compact JSON bytes with deterministic ordering.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Counts describing a snapshot, cheap enough to keep in a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub branch_id: BranchId,
    pub created_at: Timestamp,
    /// Document count per collection
    pub collections: BTreeMap<CollectionName, usize>,
    pub document_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new(SchemaVersion::new(1, 0), "main", "node-1", 42);
        for (id, number) in [("b", "F-2"), ("a", "F-1")] {
            let doc = Document::from_input(id, json!({ "number": number }), 1, "t", None).unwrap();
            snapshot.add_document("invoices", doc);
        }
        snapshot.add_collection("customers");
        snapshot
    }

    #[test]
    fn counts_and_summary() {
        let snapshot = sample();
        assert_eq!(snapshot.document_count(), 2);
        assert_eq!(snapshot.collection_names(), vec!["customers", "invoices"]);

        let summary = snapshot.summary();
        assert_eq!(summary.collections["invoices"], 2);
        assert_eq!(summary.collections["customers"], 0);
        assert_eq!(summary.document_count, 2);
    }

    #[test]
    fn json_is_deterministic() {
        let a = sample().to_json().unwrap();
        let b = sample().to_json().unwrap();
        assert_eq!(a, b);

        let parsed = StoreSnapshot::from_json(&a).unwrap();
        assert_eq!(parsed, sample());
        assert_eq!(parsed.get_document("invoices", "a").unwrap().fields["number"], "F-1");
    }

    #[test]
    fn rejects_newer_format() {
        let mut snapshot = sample();
        snapshot.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        assert!(matches!(
            StoreSnapshot::from_json(&bytes),
            Err(Error::InvalidSnapshot(_))
        ));
        assert!(StoreSnapshot::from_json(b"not json").is_err());
    }
}
