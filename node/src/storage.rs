//! On-disk layout and per-branch backing files.
//!
//! ```text
//! {data_dir}/
//!   node_id
//!   restore.marker            present only while a restore is applying
//!   branches/{branch}/
//!     {collection}.db         one journal per collection
//!     _changes.db             change-capture log
//!     _audit.db               audit log
//!   backups/
//!     {name}-{stamp}-{rand}.tly
//!     _catalog.db             snapshot catalog
//! ```

use crate::crypto::FieldCipher;
use crate::error::{Result, StoreError};
use crate::journal::{tombstone, Journal};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tally_engine::{AuditEntry, BranchId, ChangeId, ChangeLogEntry, Document, Mutation, Schema};
use tracing::{debug, instrument};

pub const CHANGES_JOURNAL: &str = "_changes";
pub const AUDIT_JOURNAL: &str = "_audit";
pub const CATALOG_JOURNAL: &str = "_catalog";
const JOURNAL_EXTENSION: &str = "db";

/// Paths of everything the node persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    data_dir: PathBuf,
}

impl Layout {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn branch_dir(&self, branch: &str) -> PathBuf {
        self.data_dir.join("branches").join(branch)
    }

    pub fn collection_path(&self, branch: &str, collection: &str) -> PathBuf {
        self.branch_dir(branch)
            .join(format!("{collection}.{JOURNAL_EXTENSION}"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.backups_dir()
            .join(format!("{CATALOG_JOURNAL}.{JOURNAL_EXTENSION}"))
    }

    pub fn marker_path(&self) -> PathBuf {
        self.data_dir.join("restore.marker")
    }

    pub fn node_id_path(&self) -> PathBuf {
        self.data_dir.join("node_id")
    }

    /// Create the directories used by `branch`.
    pub async fn ensure(&self, branch: &str) -> Result<()> {
        for dir in [self.branch_dir(branch), self.backups_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    /// Read the persisted node id, generating one on first start.
    pub async fn load_or_create_node_id(&self) -> Result<String> {
        let path = self.node_id_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
        }

        let id = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| StoreError::io(format!("creating {}", self.data_dir.display()), e))?;
        tokio::fs::write(&path, &id)
            .await
            .map_err(|e| StoreError::io(format!("writing {}", path.display()), e))?;
        Ok(id)
    }
}

/// Backing files of one branch, with the field cipher for sensitive
/// collections.
#[derive(Debug, Clone)]
pub struct BranchStorage {
    layout: Layout,
    branch: BranchId,
    /// Sensitive field per collection
    sensitive: HashMap<String, String>,
    cipher: Option<Arc<FieldCipher>>,
}

impl BranchStorage {
    pub fn new(
        layout: Layout,
        branch: impl Into<BranchId>,
        schema: &Schema,
        cipher: Option<Arc<FieldCipher>>,
    ) -> Self {
        let sensitive = schema
            .collections
            .values()
            .filter_map(|c| Some((c.name.clone(), c.sensitive_field.clone()?)))
            .collect();
        Self {
            layout,
            branch: branch.into(),
            sensitive,
            cipher,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn journal(&self, collection: &str) -> Journal {
        Journal::new(self.layout.collection_path(&self.branch, collection))
    }

    /// Encode a document for disk, encrypting its sensitive field when a
    /// cipher is configured.
    pub fn encode_document(&self, collection: &str, doc: &Document) -> Result<Value> {
        let stored = match (self.sensitive.get(collection), &self.cipher) {
            (Some(field), Some(cipher)) => cipher.encrypt_document(doc, field)?,
            _ => doc.clone(),
        };
        Ok(serde_json::to_value(stored)?)
    }

    /// Decode a stored document, decrypting its sensitive field.
    pub fn decode_document(&self, collection: &str, record: Value) -> Result<Document> {
        let mut doc: Document = serde_json::from_value(record)?;
        if let Some(field) = self.sensitive.get(collection) {
            match &self.cipher {
                Some(cipher) => cipher.decrypt_document(&mut doc, field)?,
                None => {
                    if doc.fields.get(field).is_some_and(FieldCipher::is_encrypted) {
                        return Err(StoreError::Crypto(format!(
                            "document '{}' in '{collection}' is encrypted but no key is configured",
                            doc.id
                        )));
                    }
                }
            }
        }
        Ok(doc)
    }

    #[instrument(skip(self), fields(branch = %self.branch), level = "debug")]
    pub async fn load_collection(&self, collection: &str) -> Result<Vec<Document>> {
        let records = self.journal(collection).load().await?;
        let docs = records
            .into_iter()
            .map(|r| self.decode_document(collection, r))
            .collect::<Result<Vec<_>>>()?;
        debug!(collection, count = docs.len(), "collection loaded");
        Ok(docs)
    }

    /// Persist the document images of a mutation in one append.
    pub async fn persist_documents(&self, mutation: &Mutation) -> Result<()> {
        let lines = mutation
            .applied
            .iter()
            .map(|step| match (&step.after, &step.before) {
                (Some(after), _) => self.encode_document(&mutation.collection, after),
                (None, Some(before)) => Ok(tombstone(before.id.clone())),
                (None, None) => Err(StoreError::Validation("empty mutation step".to_string())),
            })
            .collect::<Result<Vec<_>>>()?;
        self.journal(&mutation.collection).append(&lines).await
    }

    /// Compact a collection file to exactly `docs`.
    pub async fn rewrite_collection<'a>(
        &self,
        collection: &str,
        docs: impl IntoIterator<Item = &'a Document>,
    ) -> Result<()> {
        let lines = self.encode_all(collection, docs)?;
        self.journal(collection).rewrite(&lines).await
    }

    pub fn rewrite_collection_blocking<'a>(
        &self,
        collection: &str,
        docs: impl IntoIterator<Item = &'a Document>,
    ) -> Result<()> {
        let lines = self.encode_all(collection, docs)?;
        self.journal(collection).rewrite_blocking(&lines)
    }

    fn encode_all<'a>(
        &self,
        collection: &str,
        docs: impl IntoIterator<Item = &'a Document>,
    ) -> Result<Vec<Value>> {
        let mut docs: Vec<&Document> = docs.into_iter().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs.into_iter()
            .map(|d| self.encode_document(collection, d))
            .collect()
    }

    /// Compact the journals of `collections` plus the change and audit logs.
    /// Returns the number of lines dropped.
    pub async fn compact<'a>(
        &self,
        collections: impl IntoIterator<Item = &'a str>,
        min_dead: usize,
    ) -> Result<usize> {
        let mut dropped = 0;
        for name in collections.into_iter().chain([CHANGES_JOURNAL, AUDIT_JOURNAL]) {
            dropped += self.journal(name).compact(min_dead).await?;
        }
        Ok(dropped)
    }

    // ---- Change log ----

    fn changes_journal(&self) -> Journal {
        self.journal(CHANGES_JOURNAL)
    }

    pub async fn load_changes(&self) -> Result<Vec<ChangeLogEntry>> {
        records_into(self.changes_journal().load().await?)
    }

    /// Append new or updated (acknowledged) change entries.
    pub async fn append_changes(&self, entries: &[ChangeLogEntry]) -> Result<()> {
        let lines = entries
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.changes_journal().append(&lines).await
    }

    pub async fn drop_changes(&self, ids: &[ChangeId]) -> Result<()> {
        let lines: Vec<Value> = ids.iter().map(|id| tombstone(*id)).collect();
        self.changes_journal().append(&lines).await
    }

    // ---- Audit log ----

    fn audit_journal(&self) -> Journal {
        self.journal(AUDIT_JOURNAL)
    }

    pub async fn load_audit(&self) -> Result<Vec<AuditEntry>> {
        records_into(self.audit_journal().load().await?)
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.audit_journal()
            .append(&[serde_json::to_value(entry)?])
            .await
    }
}

fn records_into<T: serde::de::DeserializeOwned>(records: Vec<Value>) -> Result<Vec<T>> {
    records
        .into_iter()
        .map(|r| serde_json::from_value(r).map_err(StoreError::from))
        .collect()
}
