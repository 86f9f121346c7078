//! Snapshot catalog.
//!
//! Metadata for every archive is kept in its own journal next to the
//! archives, so they can be listed without being opened.

use crate::archive::ArchiveHeader;
use crate::error::Result;
use crate::journal::{tombstone, Journal};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tally_engine::{BranchId, CollectionName, SchemaVersion, Timestamp};
use tokio::sync::{Mutex, MutexGuard};

/// One catalogued archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    /// File name inside the backups directory
    pub file_name: String,
    pub size_bytes: u64,
    pub created_at: Timestamp,
    pub encrypted: bool,
    /// Hex SHA-256 of the archive bytes
    pub checksum: String,
    pub schema_version: SchemaVersion,
    pub format_version: u32,
    pub branch_id: BranchId,
    pub collections: Vec<CollectionName>,
    pub document_count: usize,
}

impl SnapshotRecord {
    pub fn new(
        file_name: impl Into<String>,
        size_bytes: u64,
        checksum: impl Into<String>,
        header: &ArchiveHeader,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: header.name.clone(),
            file_name: file_name.into(),
            size_bytes,
            created_at: header.created_at,
            encrypted: header.encrypted,
            checksum: checksum.into(),
            schema_version: header.schema_version,
            format_version: header.snapshot_format,
            branch_id: header.branch_id.clone(),
            collections: header.collections.clone(),
            document_count: header.document_count,
        }
    }

    pub fn path(&self, backups_dir: &Path) -> PathBuf {
        backups_dir.join(&self.file_name)
    }
}

/// The `_catalog` journal.
///
/// Multi-step sequences (write archive then record, or the retention repair
/// pass) hold [`SnapshotCatalog::lock`] so they never interleave.
#[derive(Debug)]
pub struct SnapshotCatalog {
    journal: Journal,
    lock: Mutex<()>,
}

impl SnapshotCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            journal: Journal::new(path),
            lock: Mutex::new(()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// All records, newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotRecord>> {
        let mut records: Vec<SnapshotRecord> = self
            .journal
            .load()
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?;
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        Ok(records)
    }

    pub async fn get(&self, id: &str) -> Result<Option<SnapshotRecord>> {
        Ok(self.list().await?.into_iter().find(|r| r.id == id))
    }

    pub async fn find_by_file(&self, file_name: &str) -> Result<Option<SnapshotRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.file_name == file_name))
    }

    pub async fn insert(&self, record: &SnapshotRecord) -> Result<()> {
        self.journal.append(&[serde_json::to_value(record)?]).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.journal.append(&[tombstone(id)]).await
    }

    /// Drop superseded lines once at least `min_dead` have piled up.
    /// Caller holds the lock.
    pub async fn compact(&self, min_dead: usize) -> Result<usize> {
        self.journal.compact(min_dead).await
    }
}
