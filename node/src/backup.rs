//! Snapshot backup engine.
//!
//! ```text
//! Idle -> Snapshotting -> Compressing -> [Encrypting] -> Persisted
//! ```
//!
//! The snapshot is read under one read lock, so an archive is a consistent
//! cross-collection point in time. Sensitive fields are archived in their
//! decrypted form; archive-level encryption protects them instead.

use crate::archive::{self, ArchiveHeader, ARCHIVE_EXTENSION};
use crate::catalog::{SnapshotCatalog, SnapshotRecord};
use crate::crypto::{self, SecretKey, ARCHIVE_KEY_CONTEXT};
use crate::error::{Result, StoreError};
use crate::retention::RetentionManager;
use crate::session::Session;
use crate::storage::Layout;
use serde_json::json;
use std::fmt;
use std::path::Path;
use tally_engine::{validate_name, AuditAction, CollectionName, StoreSnapshot, Timestamp};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Options of a single backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupOptions {
    pub encrypt: bool,
    /// Passphrase for this archive; the store key is used when `None`
    pub key: Option<String>,
}

impl BackupOptions {
    pub fn encrypted() -> Self {
        Self {
            encrypt: true,
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.encrypt = true;
        self.key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Snapshotting,
    Compressing,
    Encrypting,
    Persisted,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            BackupPhase::Snapshotting => "snapshotting",
            BackupPhase::Compressing => "compressing",
            BackupPhase::Encrypting => "encrypting",
            BackupPhase::Persisted => "persisted",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Clone)]
pub struct BackupEngine {
    session: Session,
    retention: RetentionManager,
}

impl BackupEngine {
    pub fn new(session: Session, retention: RetentionManager) -> Self {
        Self { session, retention }
    }

    /// Archive the requested collections (all when `None`).
    ///
    /// Writes the archive, then its catalog record, then an audit entry, and
    /// finally runs retention. A retention failure does not fail the backup.
    #[instrument(skip(self, collections, options), fields(encrypt = options.encrypt))]
    pub async fn create_backup(
        &self,
        name: &str,
        collections: Option<&[CollectionName]>,
        options: BackupOptions,
    ) -> Result<SnapshotRecord> {
        validate_name(name)?;
        let key = self.archive_key(&options)?;

        debug!(phase = %BackupPhase::Snapshotting);
        let snapshot = self.session.snapshot(collections).await?;

        let record = write_archive(
            self.session.layout(),
            self.session.catalog(),
            &snapshot,
            name,
            key.as_ref(),
        )
        .await?;

        self.session
            .record_audit(
                AuditAction::BackupCreated,
                None,
                Some(json!({
                    "archive": record.file_name,
                    "snapshotId": record.id,
                    "encrypted": record.encrypted,
                    "documentCount": record.document_count,
                })),
            )
            .await?;

        if self.session.is_restoring() {
            debug!("restore in progress; retention skipped");
        } else if let Err(e) = self.retention.run().await {
            warn!(error = %e, "retention after backup failed");
        }
        Ok(record)
    }

    /// Catalogued archives, newest first.
    pub async fn list_backups(&self) -> Result<Vec<SnapshotRecord>> {
        self.session.catalog().list().await
    }

    fn archive_key(&self, options: &BackupOptions) -> Result<Option<SecretKey>> {
        if !options.encrypt {
            return Ok(None);
        }
        match options.key.as_deref() {
            Some(key) if !key.is_empty() => {
                Ok(Some(SecretKey::derive(ARCHIVE_KEY_CONTEXT, key.as_bytes())))
            }
            _ => self.session.archive_key().cloned().map(Some).ok_or_else(|| {
                StoreError::Validation(
                    "encrypted backup requested but no key was given or configured".to_string(),
                )
            }),
        }
    }
}

/// Encode `snapshot`, write it to the backups directory and catalog it.
///
/// The file and its record are written under the catalog lock, so retention
/// never observes one without the other.
pub(crate) async fn write_archive(
    layout: &Layout,
    catalog: &SnapshotCatalog,
    snapshot: &StoreSnapshot,
    name: &str,
    key: Option<&SecretKey>,
) -> Result<SnapshotRecord> {
    let header = ArchiveHeader::for_snapshot(name, snapshot, key.is_some());

    let json = archive::serialize(snapshot)?;
    debug!(phase = %BackupPhase::Compressing, bytes = json.len());
    let mut body = archive::compress(&json)?;
    if let Some(key) = key {
        debug!(phase = %BackupPhase::Encrypting, bytes = body.len());
        body = crypto::seal(key, &body)?;
    }
    let bytes = archive::assemble(&header, &body)?;
    let checksum = archive::checksum(&bytes);

    let file_name = archive_file_name(name, snapshot.created_at);
    let path = layout.backups_dir().join(&file_name);

    let _lock = catalog.lock().await;
    write_atomic(&path, &bytes).await?;
    let record = SnapshotRecord::new(file_name, bytes.len() as u64, checksum, &header);
    if let Err(e) = catalog.insert(&record).await {
        if let Err(cleanup) = tokio::fs::remove_file(&path).await {
            warn!(archive = %record.file_name, error = %cleanup, "uncatalogued archive left behind");
        }
        return Err(e);
    }

    info!(
        phase = %BackupPhase::Persisted,
        archive = %record.file_name,
        size = record.size_bytes,
        documents = record.document_count,
        "backup persisted"
    );
    Ok(record)
}

/// `{name}-{YYYYmmdd-HHMMSS}-{rand8}.tly`
fn archive_file_name(name: &str, created_at: Timestamp) -> String {
    let stamp = i64::try_from(created_at)
        .ok()
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|at| at.format("%Y%m%d-%H%M%S").to_string())
        .unwrap_or_else(|| "00000000-000000".to_string());
    let suffix: u32 = rand::random();
    format!("{name}-{stamp}-{suffix:08x}.{ARCHIVE_EXTENSION}")
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;
    }
    let temp = path.with_extension(format!("{ARCHIVE_EXTENSION}.tmp"));
    let mut file = tokio::fs::File::create(&temp)
        .await
        .map_err(|e| StoreError::io(format!("creating {}", temp.display()), e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(format!("writing {}", temp.display()), e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io(format!("syncing {}", temp.display()), e))?;
    drop(file);
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| StoreError::io(format!("renaming to {}", path.display()), e))
}
