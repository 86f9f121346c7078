//! Retention manager.
//!
//! Prunes archives past the retention policy, keeps the catalog and the
//! backups directory consistent, and bounds the acknowledged part of the
//! change log.

use crate::archive::{self, ARCHIVE_EXTENSION};
use crate::catalog::SnapshotRecord;
use crate::error::{Result, StoreError};
use crate::now_millis;
use crate::session::Session;
use std::collections::HashSet;
use std::time::Duration;
use tally_engine::Timestamp;
use tracing::{debug, info, instrument, warn};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Which snapshots survive.
///
/// A snapshot is kept if either rule keeps it. A disabled rule (`None`)
/// keeps nothing on its own; with both disabled everything is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Number of most recent snapshots always kept
    pub keep_last: Option<usize>,
    /// Snapshots younger than this are kept
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_last: Some(7),
            max_age: Some(DAY * 30),
        }
    }
}

impl RetentionPolicy {
    pub fn keep_all() -> Self {
        Self {
            keep_last: None,
            max_age: None,
        }
    }

    /// Records this policy deletes at `now`.
    pub fn select_expired<'a>(
        &self,
        records: &'a [SnapshotRecord],
        now: Timestamp,
    ) -> Vec<&'a SnapshotRecord> {
        if self.keep_last.is_none() && self.max_age.is_none() {
            return Vec::new();
        }

        let mut newest_first: Vec<&SnapshotRecord> = records.iter().collect();
        newest_first.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });

        newest_first
            .into_iter()
            .enumerate()
            .filter(|(rank, record)| {
                let by_count = self.keep_last.is_some_and(|n| *rank < n);
                let by_age = self
                    .max_age
                    .is_some_and(|age| now.saturating_sub(record.created_at) <= millis(age));
                !(by_count || by_age)
            })
            .map(|(_, record)| record)
            .collect()
    }
}

/// Outcome of one retention run. Archives are named by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Archives deleted by the policy
    pub deleted: Vec<String>,
    /// Catalog records whose archive was missing
    pub purged_records: Vec<String>,
    /// Uncatalogued archives whose header parsed and were catalogued
    pub adopted: Vec<String>,
    /// Uncatalogued files that are not readable archives, left for review
    pub orphans: Vec<String>,
    /// Acknowledged change entries purged
    pub purged_changes: usize,
    /// Dead journal lines dropped by compaction
    pub compacted_lines: usize,
}

/// Dead lines a journal must accumulate before it is compacted.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 256;

#[derive(Debug, Clone)]
pub struct RetentionManager {
    session: Session,
    policy: RetentionPolicy,
    /// Acknowledged change entries older than this are purged
    changelog_horizon: Option<Duration>,
    compaction_threshold: usize,
}

impl RetentionManager {
    pub fn new(session: Session, policy: RetentionPolicy, changelog_horizon: Option<Duration>) -> Self {
        Self {
            session,
            policy,
            changelog_horizon,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }

    /// Compact journals once they hold at least `min_dead` dead lines.
    pub fn with_compaction_threshold(mut self, min_dead: usize) -> Self {
        self.compaction_threshold = min_dead.max(1);
        self
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Repair the catalog, delete expired archives and purge old
    /// acknowledged changes. Refuses to run during a restore.
    #[instrument(skip(self), level = "debug")]
    pub async fn run(&self) -> Result<RetentionReport> {
        if self.session.is_restoring() {
            return Err(StoreError::StoreUnavailable(
                "retention cannot run during a restore".to_string(),
            ));
        }

        let mut report = RetentionReport::default();
        let catalog = self.session.catalog();
        let backups_dir = self.session.backups_dir();
        {
            let _lock = catalog.lock().await;
            self.repair(&mut report).await?;

            let records = catalog.list().await?;
            for record in self.policy.select_expired(&records, now_millis()) {
                let path = record.path(&backups_dir);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::io(format!("removing {}", path.display()), e)),
                }
                catalog.remove(&record.id).await?;
                info!(archive = %record.file_name, created_at = record.created_at, "expired snapshot deleted");
                report.deleted.push(record.file_name.clone());
            }
            report.compacted_lines += catalog.compact(self.compaction_threshold).await?;
        }

        if let Some(horizon) = self.changelog_horizon {
            let before = now_millis().saturating_sub(millis(horizon));
            report.purged_changes = self.session.purge_acknowledged_changes(before).await?;
        }
        report.compacted_lines += self
            .session
            .compact_journals(self.compaction_threshold)
            .await?;

        debug!(
            deleted = report.deleted.len(),
            purged_changes = report.purged_changes,
            compacted_lines = report.compacted_lines,
            "retention finished"
        );
        Ok(report)
    }

    /// Reconcile the catalog with the backups directory.
    ///
    /// Caller holds the catalog lock.
    async fn repair(&self, report: &mut RetentionReport) -> Result<()> {
        let catalog = self.session.catalog();
        let dir = self.session.backups_dir();
        let records = catalog.list().await?;

        for record in &records {
            let path = record.path(&dir);
            let exists = tokio::fs::try_exists(&path)
                .await
                .map_err(|e| StoreError::io(format!("checking {}", path.display()), e))?;
            if !exists {
                warn!(archive = %record.file_name, "catalog record without archive purged");
                catalog.remove(&record.id).await?;
                report.purged_records.push(record.file_name.clone());
            }
        }

        let known: HashSet<&str> = records.iter().map(|r| r.file_name.as_str()).collect();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(format!("listing {}", dir.display()), e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("listing {}", dir.display()), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXTENSION) {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if known.contains(file_name) {
                continue;
            }

            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| StoreError::io(format!("reading {}", path.display()), e))?;
            match archive::read_header(&bytes) {
                Ok(view) => {
                    let record = SnapshotRecord::new(
                        file_name,
                        bytes.len() as u64,
                        archive::checksum(&bytes),
                        &view.header,
                    );
                    catalog.insert(&record).await?;
                    warn!(archive = %file_name, "orphan archive adopted into the catalog");
                    report.adopted.push(file_name.to_string());
                }
                Err(e) => {
                    warn!(archive = %file_name, error = %e, "unreadable orphan archive flagged for review");
                    report.orphans.push(file_name.to_string());
                }
            }
        }
        Ok(())
    }
}
