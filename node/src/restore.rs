//! Restore engine.
//!
//! ```text
//! Idle -> Validating -> Extracting -> PreRestoreSnapshot -> Applying -> Committed
//!                                                                   \-> RolledBack
//! ```
//!
//! Before anything is applied the live store is archived as a regular
//! `pre-restore` snapshot and a marker naming it is written to
//! `{data_dir}/restore.marker`. The marker is removed at `Committed` or after
//! a rollback. If the process dies in between, the next [`Session::open`]
//! finds the marker and rolls the branch back from that archive.

use crate::archive::{self, ArchiveHeader};
use crate::backup::write_archive;
use crate::catalog::SnapshotRecord;
use crate::crypto::{FieldCipher, SecretKey, ARCHIVE_KEY_CONTEXT};
use crate::error::{Result, StoreError};
use crate::now_millis;
use crate::session::{ExclusiveGuard, OpenStore, Session};
use crate::storage::{BranchStorage, Layout};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tally_engine::{
    AuditAction, BranchId, CollectionName, Compatibility, RestoreMode, Schema, StoreSnapshot,
    Timestamp,
};
use tracing::{debug, error, info, instrument, warn};

/// Name of the safety archive taken before every restore.
pub const PRE_RESTORE_NAME: &str = "pre-restore";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Replace collections wholesale instead of merging by id
    pub clear_existing: bool,
    /// Passphrase of the archive; the store key is used when `None`
    pub key: Option<String>,
}

impl RestoreOptions {
    pub fn replace() -> Self {
        Self {
            clear_existing: true,
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    fn mode(&self) -> RestoreMode {
        if self.clear_existing {
            RestoreMode::Replace
        } else {
            RestoreMode::Merge
        }
    }
}

/// Result of [`RestoreEngine::validate_backup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupValidation {
    pub valid: bool,
    /// Restorable, but not a perfect match (minor schema drift, other branch)
    pub warning: Option<String>,
    pub error: Option<StoreError>,
}

impl BackupValidation {
    fn passed(warning: Option<String>) -> Self {
        Self {
            valid: true,
            warning,
            error: None,
        }
    }

    fn failed(error: StoreError) -> Self {
        Self {
            valid: false,
            warning: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Validating,
    Extracting,
    PreRestoreSnapshot,
    Applying,
    Committed,
    RolledBack,
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            RestorePhase::Validating => "validating",
            RestorePhase::Extracting => "extracting",
            RestorePhase::PreRestoreSnapshot => "pre-restore-snapshot",
            RestorePhase::Applying => "applying",
            RestorePhase::Committed => "committed",
            RestorePhase::RolledBack => "rolled-back",
        };
        f.write_str(phase)
    }
}

/// Fault injection for the Applying phase. `n` counts collections already
/// applied when the fault fires.
#[doc(hidden)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailPoint {
    #[default]
    None,
    /// Fail with an IO error; the engine rolls back
    ErrorAfter(usize),
    /// Stop dead, leaving the marker and a half-applied store behind
    CrashAfter(usize),
}

/// Contents of `restore.marker`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreMarker {
    branch_id: BranchId,
    /// Pre-restore archive inside the backups directory
    safety_file: String,
    safety_id: String,
    archive: String,
    started_at: Timestamp,
    collections: Vec<CollectionName>,
}

/// Outcome of a committed restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub archive: String,
    /// The pre-restore safety archive
    pub safety: SnapshotRecord,
    pub collections: Vec<CollectionName>,
    pub documents: usize,
    pub mode: RestoreMode,
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreEngine {
    session: Session,
    fail_point: FailPoint,
}

/// A verified archive.
struct Checked {
    name: String,
    bytes: Vec<u8>,
    header: ArchiveHeader,
    warnings: Vec<String>,
}

/// Why the Applying phase stopped.
enum Interrupt {
    Failed(StoreError),
    Crash,
}

impl From<StoreError> for Interrupt {
    fn from(err: StoreError) -> Self {
        Interrupt::Failed(err)
    }
}

impl RestoreEngine {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            fail_point: FailPoint::None,
        }
    }

    #[doc(hidden)]
    pub fn with_fail_point(mut self, fail_point: FailPoint) -> Self {
        self.fail_point = fail_point;
        self
    }

    /// Check an archive without touching the store.
    ///
    /// The archive must be catalogued, match its recorded checksum, carry a
    /// readable header and share the live schema's major version.
    pub async fn validate_backup(&self, path: impl AsRef<Path>) -> BackupValidation {
        let branch = self.session.branch().await.ok();
        match self.check(path.as_ref(), branch.as_deref()).await {
            Ok(checked) => BackupValidation::passed(join_warnings(&checked.warnings)),
            Err(e) => BackupValidation::failed(e),
        }
    }

    async fn check(&self, path: &Path, branch: Option<&str>) -> Result<Checked> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("archive '{name}'")))
            }
            Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
        };

        let record = self
            .session
            .catalog()
            .find_by_file(&name)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("archive '{name}' is not catalogued")))?;
        let actual = archive::checksum(&bytes);
        if actual != record.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                archive: name,
                expected: record.checksum,
                actual,
            });
        }

        let header = archive::read_header(&bytes)?.header;
        let live = self.session.schema().version;
        let mut warnings = Vec::new();
        match live.compatibility(header.schema_version) {
            Compatibility::Exact => {}
            Compatibility::MinorDrift => warnings.push(format!(
                "archive schema version {} differs from live version {live}",
                header.schema_version
            )),
            Compatibility::Incompatible => {
                return Err(StoreError::VersionIncompatible {
                    archive: name,
                    archive_version: header.schema_version.to_string(),
                    live_version: live.to_string(),
                })
            }
        }
        if let Some(branch) = branch {
            if header.branch_id != branch {
                warnings.push(format!(
                    "archive was taken on branch '{}', restoring into '{branch}'",
                    header.branch_id
                ));
            }
        }

        Ok(Checked {
            name,
            bytes,
            header,
            warnings,
        })
    }

    /// Restore an archive into the active branch.
    ///
    /// Every collection in the archive is merged by id (the archive wins) or,
    /// with `clear_existing`, replaced. On any failure the store is rolled
    /// back to the pre-restore snapshot and the original error is returned.
    #[instrument(skip(self, path, options), fields(archive = %path.as_ref().display()))]
    pub async fn restore_backup(
        &self,
        path: impl AsRef<Path>,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        debug!(phase = %RestorePhase::Validating);
        let mut checked = self.check(path.as_ref(), None).await?;

        let guard = self.session.exclusive().await?;
        if checked.header.branch_id != guard.store.branch_id().as_str() {
            checked.warnings.push(format!(
                "archive was taken on branch '{}', restoring into '{}'",
                checked.header.branch_id,
                guard.store.branch_id()
            ));
        }

        debug!(phase = %RestorePhase::Extracting);
        let key = options
            .key
            .as_deref()
            .map(|k| SecretKey::derive(ARCHIVE_KEY_CONTEXT, k.as_bytes()))
            .or_else(|| self.session.archive_key().cloned());
        let (_, snapshot) = archive::decode(&checked.bytes, key.as_ref())?;
        for name in snapshot.collections.keys() {
            guard.store.collection(name)?;
        }

        debug!(phase = %RestorePhase::PreRestoreSnapshot);
        let safety_state = guard.store.export_state(None, now_millis())?;
        let safety = write_archive(
            self.session.layout(),
            self.session.catalog(),
            &safety_state,
            PRE_RESTORE_NAME,
            self.session.archive_key(),
        )
        .await?;

        let marker_path = self.session.layout().marker_path();
        let marker = RestoreMarker {
            branch_id: guard.store.branch_id().clone(),
            safety_file: safety.file_name.clone(),
            safety_id: safety.id.clone(),
            archive: checked.name.clone(),
            started_at: now_millis(),
            collections: snapshot.collection_names(),
        };
        write_marker(&marker_path, &marker).await?;

        let mode = options.mode();
        let mut txn = RestoreTxn::begin(guard, safety_state, marker_path);
        debug!(phase = %RestorePhase::Applying, ?mode);
        match self.apply(&mut txn, &snapshot, mode).await {
            Ok(documents) => {
                txn.commit().await?;
                let warning = join_warnings(&checked.warnings);
                txn.state()
                    .audit(
                        AuditAction::Restored,
                        None,
                        Vec::new(),
                        Some(json!({
                            "archive": checked.name,
                            "safetyArchive": safety.file_name,
                            "mode": mode,
                            "documents": documents,
                        })),
                    )
                    .await;
                info!(phase = %RestorePhase::Committed, documents, "restore committed");
                Ok(RestoreReport {
                    archive: checked.name,
                    safety,
                    collections: snapshot.collection_names(),
                    documents,
                    mode,
                    warning,
                })
            }
            Err(Interrupt::Crash) => {
                txn.abandon();
                Err(StoreError::StoreUnavailable(format!(
                    "restore of '{}' interrupted; state recovers on next open",
                    checked.name
                )))
            }
            Err(Interrupt::Failed(cause)) => match txn.rollback().await {
                Ok(()) => {
                    warn!(phase = %RestorePhase::RolledBack, error = %cause, "restore rolled back");
                    Err(cause)
                }
                Err(rollback) => {
                    error!(error = %cause, rollback = %rollback, "restore rollback failed");
                    Err(StoreError::RollbackFailed {
                        cause: cause.to_string(),
                        rollback: rollback.to_string(),
                    })
                }
            },
        }
    }

    async fn apply(
        &self,
        txn: &mut RestoreTxn,
        snapshot: &StoreSnapshot,
        mode: RestoreMode,
    ) -> std::result::Result<usize, Interrupt> {
        let mut documents = 0;
        for (applied, (name, docs)) in snapshot.collections.iter().enumerate() {
            match self.fail_point {
                FailPoint::ErrorAfter(n) if n == applied => {
                    return Err(Interrupt::Failed(StoreError::StorageIo(format!(
                        "injected failure before '{name}'"
                    ))))
                }
                FailPoint::CrashAfter(n) if n == applied => return Err(Interrupt::Crash),
                _ => {}
            }

            let state = txn.state();
            state
                .store
                .restore_collection(name, docs.values().cloned(), mode)
                .map_err(StoreError::from)?;
            let restored = state.store.collection(name).map_err(StoreError::from)?;
            state
                .storage
                .rewrite_collection(name, restored.documents())
                .await?;
            documents += docs.len();
            debug!(collection = %name, count = docs.len(), "collection restored");
        }
        Ok(documents)
    }
}

fn join_warnings(warnings: &[String]) -> Option<String> {
    (!warnings.is_empty()).then(|| warnings.join("; "))
}

/// Scoped guard over the Applying phase.
///
/// Holds the store exclusively. Unless [`commit`](Self::commit),
/// [`rollback`](Self::rollback) or [`abandon`](Self::abandon) ran, dropping
/// it rolls back synchronously, so an early return, a panic or a cancelled
/// future never leaves a half-applied store.
struct RestoreTxn {
    guard: ExclusiveGuard,
    safety: StoreSnapshot,
    marker: PathBuf,
    active: bool,
}

impl RestoreTxn {
    fn begin(guard: ExclusiveGuard, safety: StoreSnapshot, marker: PathBuf) -> Self {
        Self {
            guard,
            safety,
            marker,
            active: true,
        }
    }

    fn state(&mut self) -> &mut OpenStore {
        &mut self.guard
    }

    async fn commit(&mut self) -> Result<()> {
        remove_marker(&self.marker).await?;
        self.active = false;
        Ok(())
    }

    /// Put back the pre-restore state in memory and on disk.
    ///
    /// The marker is removed only once every file is rewritten; if this
    /// fails the next open replays it.
    async fn rollback(&mut self) -> Result<()> {
        self.active = false;
        let OpenStore { store, storage, .. } = &mut *self.guard;
        store.import_state(&self.safety)?;
        for name in store.schema().collection_names() {
            let docs = store.collection(&name)?.documents();
            storage.rewrite_collection(&name, docs).await?;
        }
        remove_marker(&self.marker).await
    }

    fn rollback_blocking(&mut self) -> Result<()> {
        let OpenStore { store, storage, .. } = &mut *self.guard;
        store.import_state(&self.safety)?;
        for name in store.schema().collection_names() {
            let docs = store.collection(&name)?.documents();
            storage.rewrite_collection_blocking(&name, docs)?;
        }
        match std::fs::remove_file(&self.marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(format!("removing {}", self.marker.display()), e)),
        }
    }

    /// Leave everything as it is, marker included. The store stays
    /// unavailable until it is reopened.
    fn abandon(&mut self) {
        self.active = false;
        self.guard.poison();
    }
}

impl Drop for RestoreTxn {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        warn!("restore dropped before completion; rolling back");
        if let Err(e) = self.rollback_blocking() {
            error!(error = %e, "rollback failed; the restore marker is kept for the next open");
        }
    }
}

async fn write_marker(path: &Path, marker: &RestoreMarker) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(marker)?;
    let temp = path.with_extension("tmp");
    tokio::fs::write(&temp, &bytes)
        .await
        .map_err(|e| StoreError::io(format!("writing {}", temp.display()), e))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| StoreError::io(format!("renaming to {}", path.display()), e))
}

async fn remove_marker(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(format!("removing {}", path.display()), e)),
    }
}

/// Roll back a restore that never reached `Committed`.
///
/// Rewrites every collection file of the marker's branch from the
/// pre-restore archive, then removes the marker. Returns whether a marker
/// was found.
pub(crate) async fn replay_interrupted_restore(
    layout: &Layout,
    schema: &Schema,
    cipher: Option<Arc<FieldCipher>>,
    archive_key: Option<&SecretKey>,
) -> Result<bool> {
    let path = layout.marker_path();
    let marker: RestoreMarker = match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
    };
    warn!(
        archive = %marker.archive,
        safety = %marker.safety_file,
        branch = %marker.branch_id,
        "interrupted restore found; replaying rollback"
    );

    let safety_path = layout.backups_dir().join(&marker.safety_file);
    let bytes = tokio::fs::read(&safety_path)
        .await
        .map_err(|e| StoreError::io(format!("reading {}", safety_path.display()), e))?;
    let (_, snapshot) = archive::decode(&bytes, archive_key)?;

    let storage = BranchStorage::new(layout.clone(), marker.branch_id.clone(), schema, cipher);
    for name in schema.collection_names() {
        let docs = snapshot.collections.get(&name).into_iter().flat_map(|d| d.values());
        storage.rewrite_collection(&name, docs).await?;
    }
    remove_marker(&path).await?;
    info!(branch = %marker.branch_id, "pre-restore state recovered");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupEngine, BackupOptions};
    use crate::config::Config;
    use crate::retention::{RetentionManager, RetentionPolicy};
    use crate::session::WriteOptions;
    use tally_engine::{CollectionSchema, Document, Filter, FindOptions, SchemaVersion, Sort};

    fn schema(minor: u32) -> Schema {
        Schema::new(SchemaVersion::new(1, minor))
            .with_collection(CollectionSchema::new("invoices", vec![]).with_unique("number"))
            .with_collection(CollectionSchema::new("customers", vec![]))
    }

    async fn open(dir: &tempfile::TempDir) -> Session {
        Session::open(Config::new(dir.path()), schema(0), None)
            .await
            .unwrap()
    }

    fn backups(session: &Session) -> BackupEngine {
        let retention = RetentionManager::new(session.clone(), RetentionPolicy::keep_all(), None);
        BackupEngine::new(session.clone(), retention)
    }

    async fn all(session: &Session, collection: &str) -> Vec<Document> {
        session
            .find(collection, &Filter::all(), FindOptions::default().sorted_by(Sort::asc("_id")))
            .await
            .unwrap()
    }

    async fn seed(session: &Session) {
        for i in 0..3 {
            session
                .insert("invoices", json!({"number": format!("F-{i}")}), WriteOptions::default())
                .await
                .unwrap();
        }
        session
            .insert("customers", json!({"name": "acme"}), WriteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn merge_keeps_live_only_documents() {
        let dir = tempfile::tempdir().unwrap();
        let session = open(&dir).await;
        seed(&session).await;
        let record = backups(&session)
            .create_backup("daily", None, BackupOptions::default())
            .await
            .unwrap();

        session
            .update("invoices", &Filter::all().eq("number", "F-0"), json!({"paid": true}), WriteOptions::default())
            .await
            .unwrap();
        session
            .insert("invoices", json!({"number": "F-9"}), WriteOptions::default())
            .await
            .unwrap();
        let pending_before = session.pending().await.unwrap().len();

        let report = RestoreEngine::new(session.clone())
            .restore_backup(record.path(&session.backups_dir()), RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(report.mode, RestoreMode::Merge);
        assert_eq!(report.documents, 4);
        assert!(report.warning.is_none());

        // archive wins on shared ids, live-only documents survive
        let restored = session.find_one("invoices", &Filter::all().eq("number", "F-0")).await.unwrap().unwrap();
        assert!(restored.fields.get("paid").is_none());
        assert_eq!(session.count("invoices", &Filter::all()).await.unwrap(), 4);
        // restores are not replicated
        assert_eq!(session.pending().await.unwrap().len(), pending_before);
        assert!(!dir.path().join("restore.marker").exists());

        let audit = session.audit_entries(None).await.unwrap();
        assert_eq!(audit.last().unwrap().action, AuditAction::Restored);
    }

    #[tokio::test]
    async fn replace_drops_live_only_documents() {
        let dir = tempfile::tempdir().unwrap();
        let session = open(&dir).await;
        seed(&session).await;
        let before = all(&session, "invoices").await;
        let record = backups(&session)
            .create_backup("daily", None, BackupOptions::default())
            .await
            .unwrap();

        session
            .insert("invoices", json!({"number": "F-9"}), WriteOptions::default())
            .await
            .unwrap();
        RestoreEngine::new(session.clone())
            .restore_backup(record.path(&session.backups_dir()), RestoreOptions::replace())
            .await
            .unwrap();
        assert_eq!(all(&session, "invoices").await, before);

        // the restored unique index is live
        let err = session
            .insert("invoices", json!({"number": "F-1"}), WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn injected_error_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let session = open(&dir).await;
        seed(&session).await;
        let record = backups(&session)
            .create_backup("daily", None, BackupOptions::default())
            .await
            .unwrap();
        session
            .remove("customers", &Filter::all(), WriteOptions::multi())
            .await
            .unwrap();
        let invoices = all(&session, "invoices").await;

        let err = RestoreEngine::new(session.clone())
            .with_fail_point(FailPoint::ErrorAfter(1))
            .restore_backup(record.path(&session.backups_dir()), RestoreOptions::replace())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StorageIo(_)));

        // "customers" was applied first and has been rolled back
        assert_eq!(session.count("customers", &Filter::all()).await.unwrap(), 0);
        assert_eq!(all(&session, "invoices").await, invoices);
        assert!(!session.is_restoring());
        assert!(!dir.path().join("restore.marker").exists());
    }

    #[tokio::test]
    async fn validation_reports_drift_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let session = open(&dir).await;
        seed(&session).await;
        let record = backups(&session)
            .create_backup("daily", None, BackupOptions::default())
            .await
            .unwrap();
        let path = record.path(&session.backups_dir());
        let engine = RestoreEngine::new(session.clone());

        let validation = engine.validate_backup(&path).await;
        assert!(validation.valid, "{validation:?}");
        assert!(validation.warning.is_none());

        let missing = engine.validate_backup(session.backups_dir().join("nope.tly")).await;
        assert!(matches!(missing.error, Some(StoreError::NotFound(_))));

        let stray = session.backups_dir().join("stray.tly");
        std::fs::copy(&path, &stray).unwrap();
        let uncatalogued = engine.validate_backup(&stray).await;
        assert!(matches!(uncatalogued.error, Some(StoreError::Validation(_))));
        drop(session);

        // same major, newer minor: a warning
        let session = Session::open(Config::new(dir.path()), schema(3), None)
            .await
            .unwrap();
        let validation = RestoreEngine::new(session.clone()).validate_backup(&path).await;
        assert!(validation.valid);
        assert!(validation.warning.unwrap().contains("differs"));
    }

    #[tokio::test]
    async fn major_version_mismatch_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let session = open(&dir).await;
        let record = backups(&session)
            .create_backup("daily", None, BackupOptions::default())
            .await
            .unwrap();
        drop(session);

        let newer = Schema::new(SchemaVersion::new(2, 0))
            .with_collection(CollectionSchema::new("invoices", vec![]))
            .with_collection(CollectionSchema::new("customers", vec![]));
        let session = Session::open(Config::new(dir.path()), newer, None).await.unwrap();
        let engine = RestoreEngine::new(session.clone());
        let path = record.path(&session.backups_dir());

        let validation = engine.validate_backup(&path).await;
        assert!(!validation.valid);
        assert!(matches!(validation.error, Some(StoreError::VersionIncompatible { .. })));
        assert!(engine.restore_backup(&path, RestoreOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let session = open(&dir).await;
        seed(&session).await;
        let before = all(&session, "invoices").await;

        let mut guard = session.exclusive().await.unwrap();
        let safety = guard.store.export_state(None, 1).unwrap();
        let marker = session.layout().marker_path();
        std::fs::write(&marker, b"{}").unwrap();
        guard
            .store
            .restore_collection("invoices", Vec::new(), RestoreMode::Replace)
            .unwrap();

        let txn = RestoreTxn::begin(guard, safety, marker.clone());
        drop(txn);

        assert!(!marker.exists());
        assert!(!session.is_restoring());
        assert_eq!(all(&session, "invoices").await, before);
    }
}
