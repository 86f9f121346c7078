//! Sync driver.
//!
//! The wire protocol lives behind [`SyncTransport`]. The worker only moves
//! the sync queue across it: push pending entries, acknowledge what the
//! remote side confirms, then apply pulled changes without re-queuing them.
//! A crash between push and acknowledge re-delivers the batch, so the remote
//! side must treat pushes idempotently.

use crate::error::{Result, StoreError};
use crate::session::Session;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_engine::{ChangeId, ChangeLogEntry, ChangeOperation, CollectionName, Document, RemoteChange};
use tracing::{debug, info, instrument};

const DEFAULT_BATCH_SIZE: usize = 100;

/// A pending change with the current image of its document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundChange {
    pub entry: ChangeLogEntry,
    /// `None` for removals, or when the document is gone by now
    pub document: Option<Document>,
}

/// A change pulled from the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundChange {
    pub collection: CollectionName,
    #[serde(flatten)]
    pub change: RemoteChange,
}

/// Connection to the remote server.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send a batch. Returns the ids the remote side stored durably.
    async fn push(&self, changes: &[OutboundChange]) -> Result<Vec<ChangeId>>;

    /// Fetch changes made elsewhere.
    async fn pull(&self) -> Result<Vec<InboundChange>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub acknowledged: usize,
    pub pulled: usize,
    pub applied: usize,
}

#[derive(Clone)]
pub struct SyncWorker {
    session: Session,
    transport: Arc<dyn SyncTransport>,
    batch_size: usize,
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("session", &self.session)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl SyncWorker {
    pub fn new(session: Session, transport: Arc<dyn SyncTransport>) -> Self {
        Self {
            session,
            transport,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// One push/pull round.
    #[instrument(skip(self), level = "debug")]
    pub async fn run_once(&self) -> Result<SyncReport> {
        if self.session.is_restoring() {
            return Err(StoreError::StoreUnavailable(
                "sync cannot run during a restore".to_string(),
            ));
        }

        let mut report = SyncReport::default();
        let pending = self.session.pending().await?;
        for batch in pending.chunks(self.batch_size) {
            let outbound = self.outbound(batch).await?;
            let confirmed = self.transport.push(&outbound).await?;
            report.pushed += outbound.len();
            report.acknowledged += self.session.acknowledge(&confirmed).await?;
            debug!(batch = outbound.len(), confirmed = confirmed.len(), "batch pushed");
        }

        let inbound = self.transport.pull().await?;
        report.pulled = inbound.len();
        for change in inbound {
            report.applied += self
                .session
                .apply_remote_change(&change.collection, change.change)
                .await?;
        }

        if report.pushed > 0 || report.pulled > 0 {
            info!(
                pushed = report.pushed,
                acknowledged = report.acknowledged,
                pulled = report.pulled,
                applied = report.applied,
                "sync round finished"
            );
        }
        Ok(report)
    }

    async fn outbound(&self, entries: &[ChangeLogEntry]) -> Result<Vec<OutboundChange>> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let document = match entry.operation {
                ChangeOperation::Remove => None,
                ChangeOperation::Insert | ChangeOperation::Update => {
                    self.session.get(&entry.collection, &entry.document_id).await?
                }
            };
            out.push(OutboundChange {
                entry: entry.clone(),
                document,
            });
        }
        Ok(out)
    }
}
