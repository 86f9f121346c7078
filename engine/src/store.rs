//! Store - the in-memory state container.
//!
//! The Store holds every collection of the active branch together with the
//! change log and audit log. Mutations return a [`Mutation`] describing
//! exactly what changed so the caller can persist it, or undo it with
//! [`Store::revert`] when persisting fails.

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::changelog::{ChangeLog, ChangeLogEntry, ChangeOperation};
use crate::collection::Collection;
use crate::query::{Filter, FindOptions, Page, Sort};
use crate::{
    error::Result, ActorId, BranchId, ChangeId, CollectionName, Document, DocumentId, Error,
    LogicalClock, NodeId, Schema, StoreSnapshot, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Who is writing, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteContext {
    pub actor: ActorId,
    pub timestamp: Timestamp,
    /// Whether the call produces an audit entry. Change capture is not
    /// affected by this flag.
    pub audit: bool,
}

impl WriteContext {
    pub fn new(actor: impl Into<ActorId>, timestamp: Timestamp) -> Self {
        Self {
            actor: actor.into(),
            timestamp,
            audit: true,
        }
    }

    pub fn without_audit(mut self) -> Self {
        self.audit = false;
        self
    }
}

/// Before and after images of one affected document.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub before: Option<Document>,
    pub after: Option<Document>,
}

/// Everything a single mutating call changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub collection: CollectionName,
    pub operation: ChangeOperation,
    pub applied: Vec<Applied>,
    /// Change-log entries, one per affected document
    pub changes: Vec<ChangeLogEntry>,
    pub audit: Option<AuditEntry>,
}

impl Mutation {
    fn empty(collection: &str, operation: ChangeOperation) -> Self {
        Self {
            collection: collection.to_string(),
            operation,
            applied: Vec::new(),
            changes: Vec::new(),
            audit: None,
        }
    }

    /// Number of documents affected.
    pub fn count(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Post-mutation images (empty for removals).
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.applied.iter().filter_map(|a| a.after.as_ref())
    }

    /// Ids of the affected documents.
    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.applied
            .iter()
            .filter_map(|a| a.after.as_ref().or(a.before.as_ref()))
            .map(|d| d.id.clone())
            .collect()
    }
}

/// A change that originated on the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub operation: ChangeOperation,
    pub document_id: DocumentId,
    /// Full document image; absent for removals
    #[serde(default)]
    pub document: Option<Document>,
}

/// How archived documents are applied to a live collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestoreMode {
    /// Upsert by id; archived documents overwrite live ones
    #[default]
    Merge,
    /// Discard live documents and use the archived set
    Replace,
}

/// The main store holding all state of one branch.
#[derive(Debug, Clone)]
pub struct Store {
    schema: Schema,
    node_id: NodeId,
    branch_id: BranchId,
    /// Source of change-log and audit ids
    clock: LogicalClock,
    collections: HashMap<CollectionName, Collection>,
    changelog: ChangeLog,
    audit: AuditLog,
}

impl Store {
    /// Create an empty store with the given schema.
    pub fn new(schema: Schema, node_id: impl Into<NodeId>, branch_id: impl Into<BranchId>) -> Self {
        let node_id = node_id.into();
        let collections = Self::empty_collections(&schema);
        Self {
            clock: LogicalClock::new(node_id.clone()),
            schema,
            node_id,
            branch_id: branch_id.into(),
            collections,
            changelog: ChangeLog::new(),
            audit: AuditLog::new(),
        }
    }

    fn empty_collections(schema: &Schema) -> HashMap<CollectionName, Collection> {
        schema
            .collections
            .values()
            .map(|c| (c.name.clone(), Collection::new(c.clone())))
            .collect()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn changelog(&self) -> &ChangeLog {
        &self.changelog
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    // ---- Loading ----

    /// Drop all state and make `branch_id` the active branch.
    ///
    /// The caller loads the branch's collections and logs afterwards.
    pub fn reset_branch(&mut self, branch_id: impl Into<BranchId>) {
        self.branch_id = branch_id.into();
        self.collections = Self::empty_collections(&self.schema);
        self.changelog = ChangeLog::new();
        self.audit = AuditLog::new();
    }

    /// Replace a collection with persisted documents, rebuilding its indexes.
    pub fn load_collection(
        &mut self,
        name: &str,
        documents: impl IntoIterator<Item = Document>,
    ) -> Result<()> {
        let schema = self.collection(name)?.schema().clone();
        let collection = Collection::from_documents(schema, documents)?;
        self.collections.insert(name.to_string(), collection);
        Ok(())
    }

    pub fn load_changelog(&mut self, entries: impl IntoIterator<Item = ChangeLogEntry>) {
        self.changelog = ChangeLog::from_entries(entries);
        if let Some(max) = self.changelog.max_id() {
            self.clock.advance_to(max);
        }
    }

    pub fn load_audit(&mut self, entries: impl IntoIterator<Item = AuditEntry>) {
        self.audit = AuditLog::from_entries(entries);
        if let Some(max) = self.audit.max_id() {
            self.clock.advance_to(max);
        }
    }

    // ---- Mutations ----

    /// Insert a new document built from `fields`.
    ///
    /// `id` is used unless the fields carry their own `_id`.
    pub fn insert(
        &mut self,
        collection: &str,
        id: impl Into<DocumentId>,
        fields: Value,
        ctx: &WriteContext,
    ) -> Result<Mutation> {
        let branch = Some(self.branch_id.clone());
        let doc = Document::from_input(id, fields, ctx.timestamp, ctx.actor.clone(), branch)?;
        self.collection_mut(collection)?.insert(doc.clone())?;

        let mut mutation = Mutation::empty(collection, ChangeOperation::Insert);
        mutation.applied.push(Applied {
            before: None,
            after: Some(doc),
        });
        self.capture(&mut mutation, ctx, AuditAction::Insert);
        Ok(mutation)
    }

    /// Merge `patch` into the first matching document, or every match when
    /// `multi` is set.
    ///
    /// "First" follows the default sort (newest first). If any document
    /// fails validation the whole call is undone.
    pub fn update(
        &mut self,
        collection: &str,
        filter: &Filter,
        patch: &Value,
        multi: bool,
        ctx: &WriteContext,
    ) -> Result<Mutation> {
        let targets = self.targets(collection, filter, multi)?;
        let mut mutation = Mutation::empty(collection, ChangeOperation::Update);

        for before in targets {
            let mut after = before.clone();
            let result = after
                .merge_patch(patch, ctx.timestamp, ctx.actor.clone())
                .and_then(|_| self.collection_mut(collection)?.replace(after.clone()));

            if let Err(e) = result {
                self.undo_documents(collection, &mutation.applied);
                return Err(e);
            }
            mutation.applied.push(Applied {
                before: Some(before),
                after: Some(after),
            });
        }

        self.capture(&mut mutation, ctx, AuditAction::Update);
        Ok(mutation)
    }

    /// Remove the first matching document, or every match when `multi` is set.
    ///
    /// Matching nothing is not an error.
    pub fn remove(
        &mut self,
        collection: &str,
        filter: &Filter,
        multi: bool,
        ctx: &WriteContext,
    ) -> Result<Mutation> {
        let targets = self.targets(collection, filter, multi)?;
        let mut mutation = Mutation::empty(collection, ChangeOperation::Remove);

        let coll = self.collection_mut(collection)?;
        for doc in targets {
            if let Some(before) = coll.remove(&doc.id) {
                mutation.applied.push(Applied {
                    before: Some(before),
                    after: None,
                });
            }
        }

        self.capture(&mut mutation, ctx, AuditAction::Remove);
        Ok(mutation)
    }

    fn targets(&self, collection: &str, filter: &Filter, multi: bool) -> Result<Vec<Document>> {
        let coll = self.collection(collection)?;
        Ok(if multi {
            coll.find(filter, &FindOptions::default())
        } else {
            coll.find_one(filter, &Sort::default()).into_iter().collect()
        })
    }

    /// Record change entries (always) and an audit entry (when requested and
    /// something changed).
    fn capture(&mut self, mutation: &mut Mutation, ctx: &WriteContext, action: AuditAction) {
        if mutation.is_empty() {
            return;
        }

        for id in mutation.document_ids() {
            let entry = ChangeLogEntry {
                id: self.clock.tick(),
                collection: mutation.collection.clone(),
                operation: mutation.operation,
                document_id: id,
                actor: ctx.actor.clone(),
                branch_id: self.branch_id.clone(),
                timestamp: ctx.timestamp,
                acknowledged: false,
            };
            self.changelog.append(entry.clone());
            mutation.changes.push(entry);
        }

        if ctx.audit {
            let entry = self.record_audit(
                action,
                Some(mutation.collection.clone()),
                mutation.document_ids(),
                ctx.actor.clone(),
                ctx.timestamp,
                None,
            );
            mutation.audit = Some(entry);
        }
    }

    /// Undo a mutation in memory, including its change and audit entries.
    pub fn revert(&mut self, mutation: &Mutation) {
        self.undo_documents(&mutation.collection, &mutation.applied);
        let ids: Vec<ChangeId> = mutation.changes.iter().map(|c| c.id).collect();
        self.changelog.discard(&ids);
        if let Some(audit) = &mutation.audit {
            self.audit.discard(audit.id);
        }
    }

    fn undo_documents(&mut self, collection: &str, applied: &[Applied]) {
        let Some(coll) = self.collections.get_mut(collection) else {
            return;
        };
        for step in applied.iter().rev() {
            match (&step.before, &step.after) {
                (Some(before), _) => coll.restore(before.clone()),
                (None, Some(after)) => {
                    coll.remove(&after.id);
                }
                (None, None) => {}
            }
        }
    }

    /// Apply a change that originated remotely.
    ///
    /// Idempotent: applying the same change twice leaves the same state.
    /// Produces neither change-log nor audit entries, since the change is
    /// already known to the server.
    pub fn apply_remote(&mut self, collection: &str, change: RemoteChange) -> Result<Mutation> {
        let mut mutation = Mutation::empty(collection, change.operation);
        let coll = self.collection_mut(collection)?;

        match change.operation {
            ChangeOperation::Remove => {
                if let Some(before) = coll.remove(&change.document_id) {
                    mutation.applied.push(Applied {
                        before: Some(before),
                        after: None,
                    });
                }
            }
            ChangeOperation::Insert | ChangeOperation::Update => {
                let doc = change.document.ok_or_else(|| {
                    Error::InvalidPayload(format!(
                        "remote {} of '{}' carries no document",
                        change.operation, change.document_id
                    ))
                })?;
                if doc.id != change.document_id {
                    return Err(Error::InvalidPayload(format!(
                        "remote document id '{}' does not match '{}'",
                        doc.id, change.document_id
                    )));
                }
                let before = coll.put(doc.clone())?;
                mutation.applied.push(Applied {
                    before,
                    after: Some(doc),
                });
            }
        }

        Ok(mutation)
    }

    /// Append an audit entry that is not tied to a document mutation.
    pub fn record_audit(
        &mut self,
        action: AuditAction,
        collection: Option<CollectionName>,
        document_ids: Vec<DocumentId>,
        actor: impl Into<ActorId>,
        timestamp: Timestamp,
        detail: Option<Value>,
    ) -> AuditEntry {
        let entry = AuditEntry {
            id: self.clock.tick(),
            action,
            collection,
            document_ids,
            actor: actor.into(),
            branch_id: self.branch_id.clone(),
            timestamp,
            detail,
        };
        self.audit.append(entry.clone());
        entry
    }

    // ---- Sync queue ----

    /// Unacknowledged change entries in delivery order.
    pub fn pending(&self) -> Vec<ChangeLogEntry> {
        self.changelog.pending().into_iter().cloned().collect()
    }

    /// Acknowledge entries; returns those whose flag flipped.
    pub fn acknowledge(&mut self, ids: &[ChangeId]) -> Vec<ChangeLogEntry> {
        self.changelog.acknowledge(ids)
    }

    pub fn purge_acknowledged(&mut self, before: Timestamp) -> Vec<ChangeId> {
        self.changelog.purge_acknowledged(before)
    }

    // ---- Reads ----

    pub fn get(&self, collection: &str, id: &str) -> Result<Option<&Document>> {
        Ok(self.collection(collection)?.get(id))
    }

    pub fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        Ok(self.collection(collection)?.find(filter, options))
    }

    pub fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        Ok(self.collection(collection)?.find_one(filter, &Sort::default()))
    }

    pub fn count(&self, collection: &str, filter: &Filter) -> Result<usize> {
        Ok(self.collection(collection)?.count(filter))
    }

    pub fn find_page(
        &self,
        collection: &str,
        filter: &Filter,
        page: usize,
        per_page: usize,
        sort: Sort,
    ) -> Result<Page> {
        self.collection(collection)?
            .find_page(filter, page, per_page, sort)
    }

    // ---- Snapshots ----

    /// Copy the requested collections (all when `None`) into a snapshot.
    pub fn export_state(
        &self,
        collections: Option<&[CollectionName]>,
        created_at: Timestamp,
    ) -> Result<StoreSnapshot> {
        let names = match collections {
            Some(names) => names.to_vec(),
            None => self.schema.collection_names(),
        };

        let mut snapshot = StoreSnapshot::new(
            self.schema.version,
            self.branch_id.clone(),
            self.node_id.clone(),
            created_at,
        );
        for name in names {
            let coll = self.collection(&name)?;
            let docs: BTreeMap<DocumentId, Document> = coll
                .documents()
                .map(|d| (d.id.clone(), d.clone()))
                .collect();
            snapshot.collections.insert(name, docs);
        }
        Ok(snapshot)
    }

    /// Apply archived documents to one collection.
    ///
    /// The new state is computed on a copy first, so a unique violation
    /// leaves the live collection untouched. No change entries are emitted.
    pub fn restore_collection(
        &mut self,
        name: &str,
        documents: impl IntoIterator<Item = Document>,
        mode: RestoreMode,
    ) -> Result<()> {
        let live = self.collection(name)?;
        let next = match mode {
            RestoreMode::Replace => Collection::from_documents(live.schema().clone(), documents)?,
            RestoreMode::Merge => {
                let mut next = live.clone();
                for doc in documents {
                    next.put(doc)?;
                }
                next
            }
        };
        self.collections.insert(name.to_string(), next);
        Ok(())
    }

    /// Replace every user collection with the snapshot's contents.
    ///
    /// Collections missing from the snapshot become empty. All collections
    /// are built before any is swapped in.
    pub fn import_state(&mut self, snapshot: &StoreSnapshot) -> Result<()> {
        if let Some(unknown) = snapshot
            .collections
            .keys()
            .find(|name| !self.collections.contains_key(*name))
        {
            return Err(Error::CollectionNotFound(unknown.clone()));
        }

        let mut rebuilt = HashMap::new();
        for (name, live) in &self.collections {
            let docs = snapshot
                .collections
                .get(name)
                .map(|docs| docs.values().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            rebuilt.insert(
                name.clone(),
                Collection::from_documents(live.schema().clone(), docs)?,
            );
        }
        self.collections = rebuilt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectionSchema, FieldDef, FieldType, SchemaVersion};
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(SchemaVersion::new(1, 0))
            .with_collection(
                CollectionSchema::new(
                    "invoices",
                    vec![
                        FieldDef::required("number", FieldType::String),
                        FieldDef::optional("total", FieldType::Float),
                    ],
                )
                .with_unique("number"),
            )
            .with_collection(CollectionSchema::new("customers", vec![]))
    }

    fn store() -> Store {
        Store::new(test_schema(), "node-1", "main")
    }

    fn ctx(ts: Timestamp) -> WriteContext {
        WriteContext::new("cashier", ts)
    }

    #[test]
    fn insert_records_change_and_audit() {
        let mut s = store();
        let m = s
            .insert("invoices", "i1", json!({"number": "F-1", "total": 10.0}), &ctx(100))
            .unwrap();

        assert_eq!(m.count(), 1);
        let doc = m.documents().next().unwrap();
        assert_eq!(doc.id, "i1");
        assert_eq!(doc.branch_id.as_deref(), Some("main"));
        assert_eq!(doc.created_by, "cashier");

        assert_eq!(m.changes.len(), 1);
        assert_eq!(m.changes[0].operation, ChangeOperation::Insert);
        assert!(!m.changes[0].acknowledged);
        assert_eq!(m.audit.as_ref().unwrap().action, AuditAction::Insert);
        assert_eq!(s.pending().len(), 1);
    }

    #[test]
    fn audit_opt_out_keeps_change_capture() {
        let mut s = store();
        let m = s
            .insert("invoices", "i1", json!({"number": "F-1"}), &ctx(1).without_audit())
            .unwrap();
        assert!(m.audit.is_none());
        assert_eq!(m.changes.len(), 1);
        assert!(s.audit_log().is_empty());
    }

    #[test]
    fn unique_violation_on_insert() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1"}), &ctx(1)).unwrap();
        let err = s
            .insert("invoices", "i2", json!({"number": "F-1"}), &ctx(2))
            .unwrap_err();
        assert!(matches!(err, Error::UniqueConstraintViolation { .. }));
        assert_eq!(s.count("invoices", &Filter::all()).unwrap(), 1);
        assert_eq!(s.pending().len(), 1);
    }

    #[test]
    fn unknown_collection() {
        let mut s = store();
        let err = s.insert("ghosts", "g", json!({}), &ctx(1)).unwrap_err();
        assert!(matches!(err, Error::CollectionNotFound(_)));
        assert!(s.find("ghosts", &Filter::all(), &FindOptions::default()).is_err());
    }

    #[test]
    fn update_first_match_by_default() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1", "total": 1.0}), &ctx(1)).unwrap();
        s.insert("invoices", "i2", json!({"number": "F-2", "total": 1.0}), &ctx(2)).unwrap();

        let m = s
            .update("invoices", &Filter::all(), &json!({"total": 5.0}), false, &ctx(3))
            .unwrap();
        assert_eq!(m.count(), 1);
        // newest document is the first match
        assert_eq!(m.changes[0].document_id, "i2");

        let m = s
            .update("invoices", &Filter::all(), &json!({"paid": true}), true, &ctx(4))
            .unwrap();
        assert_eq!(m.count(), 2);
        assert_eq!(m.changes.len(), 2);
        assert!(m.audit.is_some());

        let doc = s.get("invoices", "i1").unwrap().unwrap();
        assert_eq!(doc.fields["paid"], json!(true));
        assert_eq!(doc.fields["number"], json!("F-1"));
        assert_eq!(doc.updated_at, Some(4));
        assert_eq!(doc.updated_by.as_deref(), Some("cashier"));
    }

    #[test]
    fn failed_multi_update_is_undone() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1"}), &ctx(1)).unwrap();
        s.insert("invoices", "i2", json!({"number": "F-2"}), &ctx(2)).unwrap();
        let pending_before = s.pending().len();

        let err = s
            .update("invoices", &Filter::all(), &json!({"number": "SAME"}), true, &ctx(3))
            .unwrap_err();
        assert!(matches!(err, Error::UniqueConstraintViolation { .. }));
        assert_eq!(s.get("invoices", "i1").unwrap().unwrap().fields["number"], "F-1");
        assert_eq!(s.get("invoices", "i2").unwrap().unwrap().fields["number"], "F-2");
        assert_eq!(s.pending().len(), pending_before);
    }

    #[test]
    fn update_rejects_bad_patch_and_type() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1"}), &ctx(1)).unwrap();
        let bad_type = s.update("invoices", &Filter::all(), &json!({"total": "x"}), false, &ctx(2));
        assert!(matches!(bad_type, Err(Error::TypeMismatch { .. })));
        let reserved = s.update("invoices", &Filter::all(), &json!({"_id": "x"}), false, &ctx(2));
        assert!(matches!(reserved, Err(Error::InvalidPatch(_))));
    }

    #[test]
    fn remove_without_match_is_not_an_error() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1"}), &ctx(1)).unwrap();

        let m = s
            .remove("invoices", &Filter::by_id("missing"), false, &ctx(2))
            .unwrap();
        assert_eq!(m.count(), 0);
        assert!(m.changes.is_empty());
        assert!(m.audit.is_none());

        let m = s.remove("invoices", &Filter::by_id("i1"), false, &ctx(3)).unwrap();
        assert_eq!(m.count(), 1);
        assert_eq!(m.changes[0].operation, ChangeOperation::Remove);
        assert_eq!(s.count("invoices", &Filter::all()).unwrap(), 0);
    }

    #[test]
    fn revert_restores_previous_state() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1"}), &ctx(1)).unwrap();
        let snapshot = s.export_state(None, 0).unwrap();
        let pending = s.pending();
        let audits = s.audit_log().len();

        let m = s
            .update("invoices", &Filter::by_id("i1"), &json!({"number": "F-9"}), false, &ctx(2))
            .unwrap();
        s.revert(&m);
        let m = s.remove("invoices", &Filter::all(), true, &ctx(3)).unwrap();
        s.revert(&m);
        let m = s.insert("invoices", "i2", json!({"number": "F-2"}), &ctx(4)).unwrap();
        s.revert(&m);

        assert_eq!(s.export_state(None, 0).unwrap(), snapshot);
        assert_eq!(s.pending(), pending);
        assert_eq!(s.audit_log().len(), audits);
        // the reverted value is free again
        s.insert("invoices", "i3", json!({"number": "F-9"}), &ctx(5)).unwrap();
    }

    #[test]
    fn acknowledge_drains_pending() {
        let mut s = store();
        for i in 0..3 {
            s.insert("invoices", format!("i{i}"), json!({"number": format!("F-{i}")}), &ctx(i))
                .unwrap();
        }
        let ids: Vec<_> = s.pending().iter().map(|e| e.id).collect();
        assert_eq!(s.acknowledge(&ids).len(), 3);
        assert!(s.pending().is_empty());
        assert!(s.acknowledge(&ids).is_empty());
    }

    #[test]
    fn remote_changes_are_idempotent_and_not_queued() {
        let mut s = store();
        let doc = Document::from_input("r1", json!({"number": "R-1"}), 5, "server", None).unwrap();
        let change = RemoteChange {
            operation: ChangeOperation::Insert,
            document_id: "r1".into(),
            document: Some(doc),
        };

        s.apply_remote("invoices", change.clone()).unwrap();
        s.apply_remote("invoices", change).unwrap();
        assert_eq!(s.count("invoices", &Filter::all()).unwrap(), 1);
        assert!(s.pending().is_empty());
        assert!(s.audit_log().is_empty());

        let removal = RemoteChange {
            operation: ChangeOperation::Remove,
            document_id: "r1".into(),
            document: None,
        };
        assert_eq!(s.apply_remote("invoices", removal.clone()).unwrap().count(), 1);
        assert_eq!(s.apply_remote("invoices", removal).unwrap().count(), 0);

        let missing_doc = RemoteChange {
            operation: ChangeOperation::Update,
            document_id: "r2".into(),
            document: None,
        };
        assert!(matches!(
            s.apply_remote("invoices", missing_doc),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn export_selected_collections() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1"}), &ctx(1)).unwrap();
        s.insert("customers", "c1", json!({"name": "Acme"}), &ctx(1)).unwrap();

        let all = s.export_state(None, 10).unwrap();
        assert_eq!(all.collection_names(), vec!["customers", "invoices"]);
        assert_eq!(all.created_at, 10);

        let some = s.export_state(Some(&["invoices".to_string()]), 10).unwrap();
        assert_eq!(some.collection_names(), vec!["invoices"]);

        assert!(matches!(
            s.export_state(Some(&["ghosts".to_string()]), 10),
            Err(Error::CollectionNotFound(_))
        ));
    }

    #[test]
    fn restore_merge_and_replace() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1", "total": 1.0}), &ctx(1)).unwrap();
        let archived = s.export_state(None, 2).unwrap();

        s.update("invoices", &Filter::by_id("i1"), &json!({"total": 9.0}), false, &ctx(3))
            .unwrap();
        s.insert("invoices", "i2", json!({"number": "F-2"}), &ctx(4)).unwrap();
        let pending = s.pending().len();

        let docs: Vec<_> = archived.collections["invoices"].values().cloned().collect();
        s.restore_collection("invoices", docs.clone(), RestoreMode::Merge).unwrap();
        // archive wins for i1; i2 survives a merge
        assert_eq!(s.get("invoices", "i1").unwrap().unwrap().fields["total"], json!(1.0));
        assert!(s.get("invoices", "i2").unwrap().is_some());

        s.restore_collection("invoices", docs, RestoreMode::Replace).unwrap();
        assert!(s.get("invoices", "i2").unwrap().is_none());
        assert_eq!(s.pending().len(), pending);
    }

    #[test]
    fn merge_collision_leaves_live_collection() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1"}), &ctx(1)).unwrap();
        let clash = Document::from_input("other", json!({"number": "F-1"}), 1, "x", None).unwrap();

        let err = s
            .restore_collection("invoices", vec![clash], RestoreMode::Merge)
            .unwrap_err();
        assert!(matches!(err, Error::UniqueConstraintViolation { .. }));
        assert_eq!(s.count("invoices", &Filter::all()).unwrap(), 1);
    }

    #[test]
    fn import_state_replaces_everything() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1"}), &ctx(1)).unwrap();
        let safety = s.export_state(None, 2).unwrap();

        s.insert("invoices", "i2", json!({"number": "F-2"}), &ctx(3)).unwrap();
        s.insert("customers", "c1", json!({}), &ctx(3)).unwrap();
        s.import_state(&safety).unwrap();

        assert_eq!(s.export_state(None, 2).unwrap(), safety);
    }

    #[test]
    fn clock_moves_past_loaded_entries() {
        let mut s = store();
        s.load_changelog(vec![ChangeLogEntry {
            id: 41,
            collection: "invoices".into(),
            operation: ChangeOperation::Insert,
            document_id: "old".into(),
            actor: "a".into(),
            branch_id: "main".into(),
            timestamp: 1,
            acknowledged: true,
        }]);
        let m = s.insert("invoices", "i1", json!({"number": "F-1"}), &ctx(2)).unwrap();
        assert!(m.changes[0].id > 41);
    }

    #[test]
    fn reset_branch_clears_state() {
        let mut s = store();
        s.insert("invoices", "i1", json!({"number": "F-1"}), &ctx(1)).unwrap();
        s.reset_branch("branch-2");
        assert_eq!(s.branch_id(), "branch-2");
        assert_eq!(s.count("invoices", &Filter::all()).unwrap(), 0);
        assert!(s.pending().is_empty());
        // indexes were rebuilt, so the value is free on the new branch
        s.insert("invoices", "i9", json!({"number": "F-1"}), &ctx(2)).unwrap();
    }
}
