//! Store handle.
//!
//! A [`Session`] owns the in-memory store of the active branch together with
//! its backing files. It is cheap to clone and every clone talks to the same
//! store. Calls are serialized through one async `RwLock`; while a restore
//! holds the store exclusively every call fails fast with
//! [`StoreError::StoreUnavailable`].

use crate::catalog::SnapshotCatalog;
use crate::config::Config;
use crate::crypto::{FieldCipher, KeyProvider, SecretKey, ARCHIVE_KEY_CONTEXT, FIELD_KEY_CONTEXT};
use crate::error::{Result, StoreError};
use crate::restore;
use crate::storage::{BranchStorage, Layout};
use crate::now_millis;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tally_engine::{
    validate_name, ActorId, AuditAction, AuditEntry, BranchId, ChangeId, ChangeLogEntry,
    CollectionName, Document, DocumentId, Filter, FindOptions, Mutation, NodeId, Page,
    RemoteChange, Schema, Sort, Store, StoreSnapshot, Timestamp, WriteContext,
};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, instrument, warn};

/// Per-call write options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    /// Actor recorded on the write; the session actor when `None`
    pub actor: Option<ActorId>,
    /// Affect every match instead of the first one
    pub multi: bool,
    /// Produce an audit entry (change capture happens regardless)
    pub audit: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            actor: None,
            multi: false,
            audit: true,
        }
    }
}

impl WriteOptions {
    pub fn multi() -> Self {
        Self {
            multi: true,
            ..Self::default()
        }
    }

    pub fn by(mut self, actor: impl Into<ActorId>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn without_audit(mut self) -> Self {
        self.audit = false;
        self
    }
}

/// The store of the active branch and its backing files.
#[derive(Debug)]
pub(crate) struct OpenStore {
    pub(crate) store: Store,
    pub(crate) storage: BranchStorage,
    actor: ActorId,
}

impl OpenStore {
    #[instrument(skip(layout, schema, cipher, actor), level = "debug")]
    async fn load(
        layout: &Layout,
        schema: &Schema,
        node_id: &str,
        branch: &str,
        cipher: Option<Arc<FieldCipher>>,
        actor: ActorId,
    ) -> Result<Self> {
        layout.ensure(branch).await?;
        let storage = BranchStorage::new(layout.clone(), branch, schema, cipher);
        let mut store = Store::new(schema.clone(), node_id, branch);

        for name in schema.collection_names() {
            let docs = storage.load_collection(&name).await?;
            store.load_collection(&name, docs)?;
        }
        store.load_changelog(storage.load_changes().await?);
        store.load_audit(storage.load_audit().await?);

        debug!(
            pending = store.changelog().pending_count(),
            audit = store.audit_log().len(),
            "branch loaded"
        );
        Ok(Self {
            store,
            storage,
            actor,
        })
    }

    fn context(&self, options: &WriteOptions) -> WriteContext {
        let actor = options.actor.clone().unwrap_or_else(|| self.actor.clone());
        let ctx = WriteContext::new(actor, now_millis());
        if options.audit {
            ctx
        } else {
            ctx.without_audit()
        }
    }

    /// Persist a mutation already applied in memory.
    ///
    /// The document write is the commit point: if it fails the mutation is
    /// reverted and the error surfaces. Change-log and audit appends after
    /// that point are logged, never raised.
    pub(crate) async fn commit(&mut self, mutation: Mutation) -> Result<Mutation> {
        if mutation.is_empty() {
            return Ok(mutation);
        }
        if let Err(e) = self.storage.persist_documents(&mutation).await {
            self.store.revert(&mutation);
            error!(collection = %mutation.collection, error = %e, "write failed; mutation reverted");
            return Err(e);
        }
        if let Err(e) = self.storage.append_changes(&mutation.changes).await {
            error!(
                collection = %mutation.collection,
                count = mutation.changes.len(),
                error = %e,
                "change capture not persisted; mutation kept"
            );
        }
        if let Some(entry) = &mutation.audit {
            if let Err(e) = self.storage.append_audit(entry).await {
                warn!(collection = %mutation.collection, error = %e, "audit entry not persisted");
            }
        }
        Ok(mutation)
    }

    /// Record and persist an audit entry that is not tied to a mutation.
    pub(crate) async fn audit(
        &mut self,
        action: AuditAction,
        collection: Option<CollectionName>,
        document_ids: Vec<DocumentId>,
        detail: Option<Value>,
    ) -> AuditEntry {
        let entry = self.store.record_audit(
            action,
            collection,
            document_ids,
            self.actor.clone(),
            now_millis(),
            detail,
        );
        if let Err(e) = self.storage.append_audit(&entry).await {
            warn!(action = ?entry.action, error = %e, "audit entry not persisted");
        }
        entry
    }
}

struct Shared {
    config: Config,
    layout: Layout,
    node_id: NodeId,
    schema: Schema,
    cipher: Option<Arc<FieldCipher>>,
    archive_key: Option<SecretKey>,
    catalog: SnapshotCatalog,
    state: Arc<RwLock<OpenStore>>,
    restoring: Arc<AtomicBool>,
}

/// Handle to an open store.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Shared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("node_id", &self.inner.node_id)
            .field("data_dir", &self.inner.layout.data_dir())
            .field("encrypted", &self.inner.cipher.is_some())
            .field("restoring", &self.is_restoring())
            .finish()
    }
}

impl Session {
    /// Open the store described by `config`.
    ///
    /// Sensitive collections named in the config are marked on `schema`. If
    /// any collection is sensitive and no key provider is given, opening
    /// fails unless plaintext storage is explicitly allowed. An interrupted
    /// restore is rolled back before anything is loaded.
    #[instrument(skip_all, fields(data_dir = %config.data_dir.display(), branch = %config.branch))]
    pub async fn open(
        config: Config,
        mut schema: Schema,
        key_provider: Option<Arc<dyn KeyProvider>>,
    ) -> Result<Self> {
        schema.validate()?;
        validate_name(&config.branch)?;
        for entry in &config.sensitive {
            schema.mark_sensitive(&entry.collection, entry.field.clone())?;
        }

        let layout = Layout::new(&config.data_dir);
        layout.ensure(&config.branch).await?;
        let node_id = match &config.node_id {
            Some(id) => id.clone(),
            None => layout.load_or_create_node_id().await?,
        };

        let (cipher, archive_key) = match &key_provider {
            Some(provider) => {
                let material = provider.key_material().await?;
                (
                    Some(Arc::new(FieldCipher::new(SecretKey::derive(
                        FIELD_KEY_CONTEXT,
                        &material,
                    )))),
                    Some(SecretKey::derive(ARCHIVE_KEY_CONTEXT, &material)),
                )
            }
            None => (None, None),
        };

        let sensitive: Vec<CollectionName> = schema
            .collection_names()
            .into_iter()
            .filter(|name| schema.get_collection(name).is_some_and(|c| c.is_sensitive()))
            .collect();
        let plaintext = !sensitive.is_empty() && cipher.is_none();
        if plaintext && !config.allow_plaintext_sensitive {
            return Err(StoreError::Validation(format!(
                "collections {sensitive:?} are sensitive but no encryption key is configured; \
                 allow plaintext storage explicitly to continue"
            )));
        }

        if restore::replay_interrupted_restore(&layout, &schema, cipher.clone(), archive_key.as_ref())
            .await?
        {
            warn!("interrupted restore rolled back to the pre-restore state");
        }

        let mut open = OpenStore::load(
            &layout,
            &schema,
            &node_id,
            &config.branch,
            cipher.clone(),
            config.actor.clone(),
        )
        .await?;

        if plaintext {
            warn!(collections = ?sensitive, "sensitive collections are stored in clear");
            open.audit(
                AuditAction::PlaintextSensitive,
                None,
                Vec::new(),
                Some(json!({ "collections": sensitive })),
            )
            .await;
        }

        info!(node_id = %node_id, encrypted = cipher.is_some(), "store opened");
        let catalog = SnapshotCatalog::new(layout.catalog_path());
        Ok(Self {
            inner: Arc::new(Shared {
                config,
                layout,
                node_id,
                schema,
                cipher,
                archive_key,
                catalog,
                state: Arc::new(RwLock::new(open)),
                restoring: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_restoring() {
            return Err(StoreError::StoreUnavailable(
                "a restore is in progress".to_string(),
            ));
        }
        Ok(())
    }

    async fn read(&self) -> Result<RwLockReadGuard<'_, OpenStore>> {
        self.ensure_available()?;
        let guard = self.inner.state.read().await;
        self.ensure_available()?;
        Ok(guard)
    }

    async fn write(&self) -> Result<RwLockWriteGuard<'_, OpenStore>> {
        self.ensure_available()?;
        let guard = self.inner.state.write().await;
        self.ensure_available()?;
        Ok(guard)
    }

    /// Take the store exclusively for a restore.
    ///
    /// Sets the restore flag first, so calls arriving from now on fail fast
    /// instead of queueing behind the restore. If the returned future is
    /// dropped while it waits for the lock, the flag is cleared again.
    pub(crate) async fn exclusive(&self) -> Result<ExclusiveGuard> {
        let flag = RestoreFlag::raise(&self.inner.restoring)?;
        let state = self.inner.state.clone().write_owned().await;
        Ok(ExclusiveGuard { state, flag })
    }

    // ---- Accessors ----

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.inner.layout.backups_dir()
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.cipher.is_some()
    }

    pub fn is_restoring(&self) -> bool {
        self.inner.restoring.load(Ordering::Acquire)
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub(crate) fn catalog(&self) -> &SnapshotCatalog {
        &self.inner.catalog
    }

    pub(crate) fn archive_key(&self) -> Option<&SecretKey> {
        self.inner.archive_key.as_ref()
    }

    pub async fn branch(&self) -> Result<BranchId> {
        Ok(self.read().await?.store.branch_id().clone())
    }

    /// Change the actor recorded on writes that do not name one.
    pub async fn set_actor(&self, actor: impl Into<ActorId>) -> Result<()> {
        self.write().await?.actor = actor.into();
        Ok(())
    }

    // ---- Writes ----

    /// Insert a document with a generated id and return it.
    pub async fn insert(
        &self,
        collection: &str,
        fields: Value,
        options: WriteOptions,
    ) -> Result<Document> {
        let mut state = self.write().await?;
        let ctx = state.context(&options);
        let id = uuid::Uuid::new_v4().to_string();
        let mutation = state.store.insert(collection, id, fields, &ctx)?;
        let mutation = state.commit(mutation).await?;
        let doc = mutation.documents().next().cloned();
        doc.ok_or_else(|| StoreError::NotFound(format!("inserted document in '{collection}'")))
    }

    /// Merge `patch` into the first match (or every match with
    /// [`WriteOptions::multi`]). Returns the number of documents updated.
    pub async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Value,
        options: WriteOptions,
    ) -> Result<usize> {
        let mut state = self.write().await?;
        let ctx = state.context(&options);
        let mutation = state
            .store
            .update(collection, filter, &patch, options.multi, &ctx)?;
        Ok(state.commit(mutation).await?.count())
    }

    /// Remove the first match (or every match). Matching nothing returns 0.
    pub async fn remove(
        &self,
        collection: &str,
        filter: &Filter,
        options: WriteOptions,
    ) -> Result<usize> {
        let mut state = self.write().await?;
        let ctx = state.context(&options);
        let mutation = state.store.remove(collection, filter, options.multi, &ctx)?;
        Ok(state.commit(mutation).await?.count())
    }

    // ---- Reads ----

    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self.read().await?.store.get(collection, id)?.cloned())
    }

    pub async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<Document>> {
        Ok(self.read().await?.store.find(collection, filter, &options)?)
    }

    pub async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        Ok(self.read().await?.store.find_one(collection, filter)?)
    }

    pub async fn count(&self, collection: &str, filter: &Filter) -> Result<usize> {
        Ok(self.read().await?.store.count(collection, filter)?)
    }

    pub async fn find_page(
        &self,
        collection: &str,
        filter: &Filter,
        page: usize,
        per_page: usize,
        sort: Sort,
    ) -> Result<Page> {
        Ok(self
            .read()
            .await?
            .store
            .find_page(collection, filter, page, per_page, sort)?)
    }

    /// Audit entries, oldest first, optionally for one collection.
    pub async fn audit_entries(&self, collection: Option<&str>) -> Result<Vec<AuditEntry>> {
        let state = self.read().await?;
        let log = state.store.audit_log();
        Ok(match collection {
            Some(name) => log.for_collection(name).cloned().collect(),
            None => log.entries().to_vec(),
        })
    }

    pub(crate) async fn record_audit(
        &self,
        action: AuditAction,
        collection: Option<CollectionName>,
        detail: Option<Value>,
    ) -> Result<AuditEntry> {
        let mut state = self.write().await?;
        Ok(state.audit(action, collection, Vec::new(), detail).await)
    }

    // ---- Sync queue ----

    /// Unacknowledged change entries, oldest first.
    pub async fn pending(&self) -> Result<Vec<ChangeLogEntry>> {
        Ok(self.read().await?.store.pending())
    }

    /// Mark entries as durably received by the remote side.
    ///
    /// Idempotent; unknown and already acknowledged ids are ignored. The
    /// flipped entries are persisted before they change in memory. Returns
    /// how many entries flipped.
    pub async fn acknowledge(&self, ids: &[ChangeId]) -> Result<usize> {
        let mut state = self.write().await?;
        let ids: BTreeSet<ChangeId> = ids.iter().copied().collect();
        let flipped: Vec<ChangeLogEntry> = ids
            .iter()
            .filter_map(|id| state.store.changelog().get(*id))
            .filter(|entry| !entry.acknowledged)
            .map(|entry| ChangeLogEntry {
                acknowledged: true,
                ..entry.clone()
            })
            .collect();
        if flipped.is_empty() {
            return Ok(0);
        }

        state.storage.append_changes(&flipped).await?;
        let ids: Vec<ChangeId> = flipped.iter().map(|e| e.id).collect();
        let count = state.store.acknowledge(&ids).len();
        debug!(count, "changes acknowledged");
        Ok(count)
    }

    /// Apply a change that originated remotely, without queuing it for sync.
    /// Returns the number of documents affected.
    pub async fn apply_remote_change(&self, collection: &str, change: RemoteChange) -> Result<usize> {
        let mut state = self.write().await?;
        let mutation = state.store.apply_remote(collection, change)?;
        Ok(state.commit(mutation).await?.count())
    }

    /// Drop acknowledged change entries older than `before`.
    pub async fn purge_acknowledged_changes(&self, before: Timestamp) -> Result<usize> {
        let mut state = self.write().await?;
        let ids = state.store.purge_acknowledged(before);
        if ids.is_empty() {
            return Ok(0);
        }
        state.storage.drop_changes(&ids).await?;
        debug!(count = ids.len(), "acknowledged changes purged");
        Ok(ids.len())
    }

    /// Compact the active branch's journals. Returns the number of lines
    /// dropped.
    pub async fn compact_journals(&self, min_dead: usize) -> Result<usize> {
        let state = self.write().await?;
        let names = state.store.schema().collection_names();
        let dropped = state
            .storage
            .compact(names.iter().map(String::as_str), min_dead)
            .await?;
        if dropped > 0 {
            debug!(dropped, branch = %state.storage.branch(), "journals compacted");
        }
        Ok(dropped)
    }

    // ---- Branches and snapshots ----

    /// Re-open every collection against `branch`.
    ///
    /// Waits for in-flight calls, loads the new branch completely and only
    /// then swaps it in, so a failed load leaves the current branch open.
    #[instrument(skip(self))]
    pub async fn switch_branch(&self, branch: &str) -> Result<()> {
        validate_name(branch)?;
        let mut state = self.write().await?;
        let previous = state.store.branch_id().clone();
        if previous == branch {
            return Ok(());
        }

        let next = OpenStore::load(
            &self.inner.layout,
            &self.inner.schema,
            &self.inner.node_id,
            branch,
            self.inner.cipher.clone(),
            state.actor.clone(),
        )
        .await?;
        *state = next;
        state
            .audit(
                AuditAction::BranchSwitched,
                None,
                Vec::new(),
                Some(json!({ "from": previous })),
            )
            .await;
        info!(from = %previous, to = %branch, "branch switched");
        Ok(())
    }

    /// Consistent snapshot of the requested collections (all when `None`),
    /// taken under one read lock.
    pub async fn snapshot(&self, collections: Option<&[CollectionName]>) -> Result<StoreSnapshot> {
        Ok(self
            .read()
            .await?
            .store
            .export_state(collections, now_millis())?)
    }
}

/// The raised "restore in progress" flag. Lowered on drop unless poisoned.
struct RestoreFlag {
    restoring: Arc<AtomicBool>,
    release: bool,
}

impl RestoreFlag {
    fn raise(restoring: &Arc<AtomicBool>) -> Result<Self> {
        restoring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                StoreError::StoreUnavailable("a restore is already in progress".to_string())
            })?;
        Ok(Self {
            restoring: restoring.clone(),
            release: true,
        })
    }
}

impl Drop for RestoreFlag {
    fn drop(&mut self) {
        if self.release {
            self.restoring.store(false, Ordering::Release);
        }
    }
}

/// Exclusive access to the store during a restore.
///
/// Dropping the guard clears the restore flag, unless the guard was
/// poisoned by a simulated crash.
pub(crate) struct ExclusiveGuard {
    state: OwnedRwLockWriteGuard<OpenStore>,
    flag: RestoreFlag,
}

impl ExclusiveGuard {
    /// Keep the store unavailable after the guard is dropped.
    pub(crate) fn poison(&mut self) {
        self.flag.release = false;
    }
}

impl Deref for ExclusiveGuard {
    type Target = OpenStore;

    fn deref(&self) -> &OpenStore {
        &self.state
    }
}

impl DerefMut for ExclusiveGuard {
    fn deref_mut(&mut self) -> &mut OpenStore {
        &mut self.state
    }
}
