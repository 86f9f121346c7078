//! # Tally Node
//!
//! The IO shell around [`tally_engine`]: everything that touches disk,
//! keys, clocks or background tasks.
//!
//! - [`Session`]: the store handle. Async CRUD and queries, the sync queue,
//!   branch switching. Backed by one journal file per (branch, collection).
//! - [`BackupEngine`]: compressed, optionally encrypted archives with a
//!   checksum, listed in a catalog.
//! - [`RestoreEngine`]: validated, all-or-nothing restores with a
//!   pre-restore safety archive and crash recovery.
//! - [`RetentionManager`]: prunes archives and old acknowledged changes.
//! - [`SyncWorker`]: moves the sync queue over a [`SyncTransport`].
//! - [`Scheduler`]: runs the above periodically.
//!
//! ```no_run
//! use tally_node::{Config, Session, WriteOptions};
//! use tally_engine::{CollectionSchema, Filter, Schema, SchemaVersion};
//! use serde_json::json;
//!
//! # async fn run() -> tally_node::Result<()> {
//! let schema = Schema::new(SchemaVersion::new(1, 0))
//!     .with_collection(CollectionSchema::new("customers", vec![]));
//! let session = Session::open(Config::new("./data"), schema, None).await?;
//!
//! session
//!     .insert("customers", json!({"name": "acme"}), WriteOptions::default())
//!     .await?;
//! assert_eq!(session.count("customers", &Filter::all()).await?, 1);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod backup;
pub mod catalog;
pub mod config;
pub mod crypto;
pub mod error;
pub mod journal;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod sync;

pub use backup::{BackupEngine, BackupOptions, BackupPhase};
pub use catalog::{SnapshotCatalog, SnapshotRecord};
pub use config::{Config, ConfigError, SensitiveCollection};
pub use crypto::{FileKeyProvider, KeyProvider, StaticKeyProvider};
pub use error::{Result, StoreError};
pub use restore::{BackupValidation, FailPoint, RestoreEngine, RestoreOptions, RestorePhase, RestoreReport};
pub use retention::{RetentionManager, RetentionPolicy, RetentionReport};
pub use scheduler::Scheduler;
pub use session::{Session, WriteOptions};
pub use sync::{InboundChange, OutboundChange, SyncReport, SyncTransport, SyncWorker};

use tally_engine::Timestamp;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
