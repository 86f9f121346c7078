//! # Tally Engine
//!
//! The deterministic core of an offline-first embedded document store.
//!
//! This crate holds documents, indexes, queries, the change-capture log and
//! the audit log entirely in memory. It knows nothing about files, clocks or
//! randomness: callers pass timestamps and generated ids in, and persist the
//! [`Mutation`] each write returns.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or platform
//! - **Deterministic**: Same inputs always produce same outputs
//! - **Undoable**: every write can be reverted if it could not be persisted
//!
//! ## Core Concepts
//!
//! ### Documents and collections
//!
//! A [`Document`] carries typed metadata (id, creation stamp, creator,
//! branch, update stamp) and a bag of JSON fields. A [`Collection`] owns the
//! documents of one [`CollectionSchema`] and the [`FieldIndex`]es it
//! declares; unique indexes reject colliding values.
//!
//! ### Queries
//!
//! [`Filter`] is a conjunction of field conditions (`Eq`, `Ne`, `Gt`, `Gte`,
//! `Lt`, `Lte`, `In`, `Nin`, `Exists`). Results sort newest first unless a
//! [`Sort`] says otherwise, and can be paged with [`Store::find_page`].
//!
//! ### Change capture and audit
//!
//! Each insert, update or remove appends one [`ChangeLogEntry`] per affected
//! document. Unacknowledged entries form the sync queue
//! ([`Store::pending`], [`Store::acknowledge`]). Independently, audit-worthy
//! calls append one [`AuditEntry`].
//!
//! ## Quick Start
//!
//! ```rust
//! use tally_engine::{
//!     CollectionSchema, FieldDef, FieldType, Filter, Schema, SchemaVersion, Store,
//!     WriteContext,
//! };
//! use serde_json::json;
//!
//! // 1. Define a schema
//! let schema = Schema::new(SchemaVersion::new(1, 0)).with_collection(
//!     CollectionSchema::new("users", vec![FieldDef::required("username", FieldType::String)])
//!         .with_unique("username"),
//! );
//!
//! // 2. Create a store
//! let mut store = Store::new(schema, "till-1", "main");
//!
//! // 3. Write
//! let ctx = WriteContext::new("admin", 1706745600000);
//! let mutation = store.insert("users", "u1", json!({"username": "alice"}), &ctx).unwrap();
//! assert_eq!(mutation.changes.len(), 1);
//!
//! // 4. Query and sync
//! assert_eq!(store.count("users", &Filter::all().eq("username", "alice")).unwrap(), 1);
//! assert_eq!(store.pending().len(), 1);
//! ```
//!
//! ## Persistence
//!
//! Use [`Store::export_state`] and [`Store::import_state`] with [`StoreSnapshot`]
//! for backups. Snapshots are serializable to JSON with deterministic ordering.

pub mod audit;
pub mod changelog;
pub mod clock;
pub mod collection;
pub mod document;
pub mod error;
pub mod index;
pub mod query;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use changelog::{ChangeLog, ChangeLogEntry, ChangeOperation};
pub use clock::LogicalClock;
pub use collection::Collection;
pub use document::Document;
pub use error::Error;
pub use index::FieldIndex;
pub use query::{Condition, Filter, FindOptions, Page, Predicate, Sort, SortOrder};
pub use schema::{
    validate_name, CollectionSchema, Compatibility, FieldDef, FieldType, IndexDef, Schema,
    SchemaVersion,
};
pub use snapshot::{SnapshotSummary, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{Applied, Mutation, RemoteChange, RestoreMode, Store, WriteContext};

/// Type aliases for clarity
pub type DocumentId = String;
pub type CollectionName = String;
pub type BranchId = String;
pub type ActorId = String;
pub type NodeId = String;
pub type ChangeId = u64;
pub type Timestamp = u64;
