//! Sync engine: pushes the durable outbox to the replication channel and
//! applies batches pulled from it.
//!
//! Push is at-least-once: outbox rows are deleted only after the channel
//! accepted them, so a failed or interrupted push is retried on the next
//! cycle. Pull keeps one durable cursor per property stream, written in the
//! same SQLite transaction as the records of the batch it covers, so a batch
//! is either fully applied and never redelivered or not applied at all.

pub mod channel;
pub(crate) mod merge;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use self::channel::{HttpChannel, MemoryChannel, ReplicationChannel, ShareDirectory};
pub use self::merge::{ApplyReport, SkippedRecord};

use crate::error::{Error, Result};
use crate::journal::{ChangeBatch, ChangeRecord, Delivery};
use crate::model::PropertyId;
use crate::store::db::OutboxEntry;
use crate::store::RecordStore;
use crate::{DEFAULT_PULL_BATCH_LIMIT, DEFAULT_PUSH_BATCH_SIZE};

/// Replication state shown to the user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Saved change records not yet accepted by the channel
    pub pending_outbound: usize,
    /// Last successful push
    pub last_push: Option<DateTime<Utc>>,
    /// Last successful pull
    pub last_pull: Option<DateTime<Utc>>,
    /// Most recent failure, cleared by the next successful cycle
    pub last_error: Option<String>,
    /// Failed push or pull attempts in a row
    pub consecutive_failures: u32,
}

/// Outcome of one push and pull cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Change records accepted by the channel
    pub pushed: usize,
    /// Batches applied from the channel
    pub pulled: usize,
    /// What happened to the pulled records
    pub applied: ApplyReport,
}

/// Moves change records between a [`RecordStore`] and a [`ReplicationChannel`]
pub struct SyncEngine {
    store: Arc<RecordStore>,
    channel: Arc<dyn ReplicationChannel>,
    push_batch_size: usize,
    pull_batch_limit: usize,
    status: RwLock<SyncStatus>,
}

impl SyncEngine {
    /// Create an engine with default batch sizes
    pub fn new(store: Arc<RecordStore>, channel: Arc<dyn ReplicationChannel>) -> Self {
        Self {
            store,
            channel,
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            pull_batch_limit: DEFAULT_PULL_BATCH_LIMIT,
            status: RwLock::new(SyncStatus::default()),
        }
    }

    /// Maximum number of outbox records read per push round
    #[must_use]
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Maximum number of batches requested per pull round
    #[must_use]
    pub fn with_pull_batch_limit(mut self, limit: usize) -> Self {
        self.pull_batch_limit = limit.max(1);
        self
    }

    /// Current replication status
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        let mut status = self.status.read().clone();
        if let Ok(pending) = self.store.outbox_len() {
            status.pending_outbound = pending;
        }
        status
    }

    fn note_failure(&self, error: &Error) {
        let mut status = self.status.write();
        status.last_error = Some(error.to_string());
        status.consecutive_failures += 1;
    }

    /// Push every saved change record, oldest first.
    ///
    /// Consecutive records of one property travel as one batch. On a channel
    /// failure the records stay queued and the error is returned.
    pub async fn push(&self) -> Result<usize> {
        let origin = self.store.participant();
        let mut pushed = 0;

        loop {
            let head = self.store.outbox_head(self.push_batch_size)?;
            if head.is_empty() {
                break;
            }

            for run in runs_by_property(head) {
                let property = run[0].property;
                let seqs: Vec<i64> = run.iter().map(|e| e.seq).collect();
                let records: Vec<ChangeRecord> = run.into_iter().map(|e| e.record).collect();
                let batch = ChangeBatch::new(property, origin, &records)?;

                if let Err(e) = self.channel.send(batch).await {
                    warn!(property = %property, records = seqs.len(), error = %e, "Push failed, records stay queued");
                    if let Err(db_err) = self.store.record_push_failure(&seqs, &e) {
                        warn!(error = %db_err, "Failed to record push failure");
                    }
                    self.note_failure(&e);
                    return Err(e);
                }
                self.store.remove_outbox(&seqs)?;
                pushed += seqs.len();
            }
        }

        if pushed > 0 {
            info!(records = pushed, "Pushed change records");
        }
        self.status.write().last_push = Some(Utc::now());
        Ok(pushed)
    }

    /// Pull and apply new batches of every known stream.
    ///
    /// Streams are the live local properties plus whatever the channel lists
    /// for this participant, so a fresh device finds its private properties.
    /// A failing stream is abandoned for this round; the others still run.
    pub async fn pull(&self) -> Result<ApplyReport> {
        let (report, _) = self.pull_all().await?;
        Ok(report)
    }

    async fn pull_all(&self) -> Result<(ApplyReport, usize)> {
        let mut streams: BTreeSet<PropertyId> = self.store.streams().into_iter().collect();
        match self.channel.streams(self.store.participant()).await {
            Ok(remote) => streams.extend(remote.into_iter().filter(|s| !self.store.is_deleted(*s))),
            Err(e) => {
                self.note_failure(&e);
                return Err(e);
            }
        }

        let mut report = ApplyReport::default();
        let mut pulled = 0;
        let mut first_error = None;
        for stream in streams {
            match self.pull_stream(stream, &mut report).await {
                Ok(count) => pulled += count,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "Pull failed for stream");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            self.note_failure(&e);
            return Err(e);
        }
        if pulled > 0 {
            info!(
                batches = pulled,
                applied = report.applied,
                skipped = report.skipped.len(),
                parked = report.parked,
                deferred = report.deferred,
                "Pulled change records"
            );
        }
        self.status.write().last_pull = Some(Utc::now());
        Ok((report, pulled))
    }

    async fn pull_stream(&self, stream: PropertyId, report: &mut ApplyReport) -> Result<usize> {
        let mut pulled = 0;
        loop {
            let after = self.store.cursor(stream);
            let deliveries = self.channel.receive(stream, after, self.pull_batch_limit).await?;
            let received = deliveries.len();
            for delivery in deliveries {
                if let Some(applied) = self.handle_delivery(delivery)? {
                    report.merge(applied);
                    pulled += 1;
                }
            }
            if received < self.pull_batch_limit {
                return Ok(pulled);
            }
        }
    }

    /// Apply one delivered batch.
    ///
    /// Returns `None` for a batch at or below the stream cursor. Undecodable
    /// records are skipped and reported; a storage failure leaves the batch
    /// unapplied and the cursor unmoved.
    pub fn handle_delivery(&self, delivery: Delivery) -> Result<Option<ApplyReport>> {
        let cursor = self.store.cursor(delivery.stream);
        if delivery.seq <= cursor {
            debug!(stream = %delivery.stream, seq = delivery.seq, cursor, "Skipping redelivered batch");
            return Ok(None);
        }

        let records = if delivery.batch.property == delivery.stream {
            delivery.batch.decode()
        } else {
            vec![Err(format!("batch for property {} arrived on stream {}", delivery.batch.property, delivery.stream))]
        };
        let report = self.store.apply_remote(records, Some((delivery.stream, delivery.seq)), false)?;

        for skipped in &report.skipped {
            warn!(
                stream = %delivery.stream,
                seq = delivery.seq,
                origin = %delivery.batch.origin,
                reason = %skipped.reason,
                "Skipped change record"
            );
        }
        debug!(stream = %delivery.stream, seq = delivery.seq, applied = report.applied, "Applied batch");
        Ok(Some(report))
    }

    /// Push, then pull. Both run even if the first fails; the first error wins.
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let pushed = self.push().await;
        let pulled = self.pull_all().await;
        let pushed = pushed?;
        let (applied, pulled) = pulled?;

        let mut status = self.status.write();
        status.last_error = None;
        status.consecutive_failures = 0;
        Ok(SyncReport { pushed, pulled, applied })
    }
}

/// Split the outbox head into runs of consecutive records of one property
fn runs_by_property(entries: Vec<OutboxEntry>) -> Vec<Vec<OutboxEntry>> {
    let mut runs: Vec<Vec<OutboxEntry>> = Vec::new();
    for entry in entries {
        match runs.last_mut() {
            Some(run) if run[0].property == entry.property => run.push(entry),
            _ => runs.push(vec![entry]),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewProperty, ParticipantId};

    fn replica(channel: &MemoryChannel) -> (Arc<RecordStore>, SyncEngine) {
        let store = Arc::new(RecordStore::open_in_memory(ParticipantId::new()).unwrap());
        let engine = SyncEngine::new(Arc::clone(&store), Arc::new(channel.connect()));
        (store, engine)
    }

    #[tokio::test]
    async fn test_push_sends_saved_records_only() {
        let channel = MemoryChannel::new();
        let (store, engine) = replica(&channel);
        let home = store
            .create_property(NewProperty { name: "Blair House".into(), ..Default::default() })
            .unwrap();

        assert_eq!(engine.push().await.unwrap(), 0);
        store.save().unwrap();
        assert_eq!(engine.push().await.unwrap(), 1);
        assert_eq!(channel.stream_len(home.id), 1);
        assert_eq!(engine.status().pending_outbound, 0);
    }

    #[tokio::test]
    async fn test_push_failure_keeps_records_queued() {
        let channel = MemoryChannel::new();
        let store = Arc::new(RecordStore::open_in_memory(ParticipantId::new()).unwrap());
        let handle = channel.connect();
        let engine = SyncEngine::new(Arc::clone(&store), Arc::new(handle.clone()));
        store
            .create_property(NewProperty { name: "Blair House".into(), ..Default::default() })
            .unwrap();
        store.save().unwrap();

        handle.set_offline(true);
        let err = engine.push().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        let status = engine.status();
        assert_eq!(status.pending_outbound, 1);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.is_some());
        let (attempts, last_error) = store.head_attempts().unwrap().unwrap();
        assert_eq!(attempts, 1);
        assert!(last_error.is_some());

        handle.set_offline(false);
        let report = engine.sync_once().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(engine.status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_redelivered_batch_is_skipped_by_cursor() {
        let channel = MemoryChannel::new();
        let (alex, alex_sync) = replica(&channel);
        let (_, sam_sync) = replica(&channel);
        let home = alex
            .create_property(NewProperty { name: "Blair House".into(), ..Default::default() })
            .unwrap();
        alex.save().unwrap();
        alex_sync.push().await.unwrap();

        let delivery = channel.receive(home.id, 0, 1).await.unwrap().remove(0);
        assert!(sam_sync.handle_delivery(delivery.clone()).unwrap().is_some());
        assert!(sam_sync.handle_delivery(delivery).unwrap().is_none());
    }

    #[test]
    fn test_runs_preserve_order() {
        let a = PropertyId::new();
        let b = PropertyId::new();
        let record = |property| ChangeRecord {
            property,
            entity: crate::model::EntityRef::property(property),
            op: crate::journal::ChangeOp::Create,
            fields: crate::journal::Fields::new(),
            stamp: crate::journal::Stamp::next(0, ParticipantId::new()),
        };
        let entries: Vec<OutboxEntry> = [a, a, b, a]
            .into_iter()
            .enumerate()
            .map(|(i, property)| OutboxEntry { seq: i as i64 + 1, property, record: record(property) })
            .collect();

        let runs = runs_by_property(entries);
        let shape: Vec<(PropertyId, usize)> = runs.iter().map(|r| (r[0].property, r.len())).collect();
        assert_eq!(shape, vec![(a, 2), (b, 1), (a, 1)]);
    }
}
