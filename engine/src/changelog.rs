//! Change-capture log.
//!
//! Every local mutation appends one entry per affected document. Entries are
//! immutable apart from the `acknowledged` flag, which the sync collaborator
//! flips once the remote side has durably stored the change. The
//! unacknowledged subset is the sync queue.

use crate::{ActorId, BranchId, ChangeId, CollectionName, DocumentId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of mutation recorded by a change entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Remove,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOperation::Insert => write!(f, "insert"),
            ChangeOperation::Update => write!(f, "update"),
            ChangeOperation::Remove => write!(f, "remove"),
        }
    }
}

/// One captured mutation of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    #[serde(rename = "_id")]
    pub id: ChangeId,
    pub collection: CollectionName,
    pub operation: ChangeOperation,
    pub document_id: DocumentId,
    pub actor: ActorId,
    pub branch_id: BranchId,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub acknowledged: bool,
}

/// In-memory change log, keyed by entry id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeLog {
    entries: BTreeMap<ChangeId, ChangeLogEntry>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted entries. Later duplicates win.
    pub fn from_entries(entries: impl IntoIterator<Item = ChangeLogEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    pub fn append(&mut self, entry: ChangeLogEntry) {
        self.entries.insert(entry.id, entry);
    }

    pub fn get(&self, id: ChangeId) -> Option<&ChangeLogEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest entry id, used to move the clock past persisted ids.
    pub fn max_id(&self) -> Option<ChangeId> {
        self.entries.keys().next_back().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChangeLogEntry> {
        self.entries.values()
    }

    /// Unacknowledged entries in delivery order: timestamp, then id.
    pub fn pending(&self) -> Vec<&ChangeLogEntry> {
        let mut pending: Vec<_> = self.entries.values().filter(|e| !e.acknowledged).collect();
        pending.sort_by_key(|e| (e.timestamp, e.id));
        pending
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| !e.acknowledged).count()
    }

    /// Mark entries as acknowledged.
    ///
    /// Returns the entries whose flag actually changed. Ids that are unknown
    /// or already acknowledged are skipped.
    pub fn acknowledge(&mut self, ids: &[ChangeId]) -> Vec<ChangeLogEntry> {
        let mut flipped = Vec::new();
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                if !entry.acknowledged {
                    entry.acknowledged = true;
                    flipped.push(entry.clone());
                }
            }
        }
        flipped
    }

    /// Drop entries outright. Only used to undo a mutation that never
    /// reached disk.
    pub fn discard(&mut self, ids: &[ChangeId]) {
        for id in ids {
            self.entries.remove(id);
        }
    }

    /// Remove acknowledged entries with a timestamp before `before`.
    ///
    /// Unacknowledged entries are never purged.
    pub fn purge_acknowledged(&mut self, before: Timestamp) -> Vec<ChangeId> {
        let purged: Vec<ChangeId> = self
            .entries
            .values()
            .filter(|e| e.acknowledged && e.timestamp < before)
            .map(|e| e.id)
            .collect();
        self.discard(&purged);
        purged
    }
}
