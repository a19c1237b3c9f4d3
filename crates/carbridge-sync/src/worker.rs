//! Sync worker
//!
//! Turns one delivered change event into one full replacement of the
//! matching index entry and decides how the delivery is settled:
//!
//! 1. parse the payload; malformed events are discarded, nothing else happens
//! 2. look the record up; an absent record is acknowledged untouched
//! 3. project the record, dropping store bookkeeping fields
//! 4. delete the index entry (not-found tolerated), then create it afresh
//! 5. acknowledge on success, requeue on any failure after parsing

use async_trait::async_trait;
use carbridge_core::prelude::*;
use carbridge_core::{LatencyTimer, SyncMetrics, WorkerConfig};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest payload excerpt logged for a malformed event
const MAX_LOGGED_PAYLOAD: usize = 256;

/// Orchestrates record lookup and index replacement for each event
pub struct SyncWorker<R, I>
where
    R: RecordStore,
    I: SearchIndex,
{
    store: Arc<R>,
    index: Arc<I>,
    config: WorkerConfig,
    metrics: SyncMetrics,
    synced: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
}

impl<R, I> SyncWorker<R, I>
where
    R: RecordStore,
    I: SearchIndex,
{
    pub fn new(store: Arc<R>, index: Arc<I>, config: WorkerConfig) -> Self {
        Self {
            store,
            index,
            config,
            metrics: SyncMetrics::new("sync_worker"),
            synced: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Process one raw payload and return its disposition
    ///
    /// Never fails: every error is logged and folded into the returned
    /// disposition.
    pub async fn process(&self, payload: &[u8]) -> Disposition {
        self.metrics.record_received();
        let timer = LatencyTimer::start(|d| self.metrics.record_latency(d));

        let disposition = match ChangeEvent::parse(payload) {
            Ok(event) => self.process_event(&event).await,
            Err(e) => {
                error!(
                    error = %e,
                    payload = %excerpt(payload),
                    "Discarding malformed event"
                );
                self.metrics.record_error(e.kind());
                e.disposition()
            }
        };

        timer.stop();
        self.metrics.record_disposition(disposition);
        match disposition {
            Disposition::Ack => self.synced.fetch_add(1, Ordering::Relaxed),
            Disposition::Requeue => self.requeued.fetch_add(1, Ordering::Relaxed),
            Disposition::Discard => self.discarded.fetch_add(1, Ordering::Relaxed),
        };
        disposition
    }

    async fn process_event(&self, event: &ChangeEvent) -> Disposition {
        match self.sync(&event.id).await {
            Ok(outcome) => {
                info!(fzg_id = %event.id, outcome = outcome.as_str(), "Event synced");
                self.metrics.record_outcome(outcome);
                Disposition::Ack
            }
            Err(e) => {
                // past parsing, nothing is permanent
                error!(
                    fzg_id = %event.id,
                    error = %e,
                    kind = e.kind(),
                    retryable = e.is_retryable(),
                    "Sync failed, requeueing event"
                );
                self.metrics.record_error(e.kind());
                Disposition::Requeue
            }
        }
    }

    /// Bring the index entry for `id` in line with the current record
    pub async fn sync(&self, id: &str) -> Result<SyncOutcome> {
        let record = match self.lookup(id).await? {
            Some(record) => record,
            None => {
                debug!(fzg_id = %id, "No record found, nothing to sync");
                return Ok(SyncOutcome::RecordAbsent);
            }
        };

        let document = record.project();
        let previous = self.replace(id, &document).await?;
        Ok(SyncOutcome::Replaced { previous })
    }

    async fn lookup(&self, id: &str) -> Result<Option<CanonicalRecord>> {
        let result = with_deadline(
            "record lookup",
            self.config.lookup_timeout,
            self.store.find_by_identifier(id),
        )
        .await;

        self.metrics.record_lookup(match &result {
            Ok(Some(_)) => "found",
            Ok(None) => "absent",
            Err(_) => "error",
        });
        result
    }

    /// Delete-then-create; the create runs only if the delete succeeded or
    /// found nothing
    async fn replace(&self, id: &str, document: &SearchDocument) -> Result<DeleteOutcome> {
        let deleted = with_deadline(
            "index delete",
            self.config.index_timeout,
            self.index.delete_by_id(id),
        )
        .await;

        let previous = match deleted {
            Ok(DeleteOutcome::Deleted) => {
                debug!(fzg_id = %id, "Deleted existing document");
                self.metrics.record_index_request("delete", "deleted");
                DeleteOutcome::Deleted
            }
            Ok(DeleteOutcome::NotFound) => {
                debug!(fzg_id = %id, "Nothing to delete");
                self.metrics.record_index_request("delete", "not_found");
                DeleteOutcome::NotFound
            }
            Err(e) => {
                warn!(fzg_id = %id, error = %e, "Delete failed, skipping create");
                self.metrics.record_index_request("delete", "error");
                return Err(e);
            }
        };

        let created = with_deadline(
            "index create",
            self.config.index_timeout,
            self.index.create_with_id(id, document),
        )
        .await;

        match created {
            Ok(()) => {
                debug!(fzg_id = %id, fields = document.len(), "Created document");
                self.metrics.record_index_request("create", "created");
                Ok(previous)
            }
            Err(e) => {
                self.metrics.record_index_request("create", "error");
                Err(e)
            }
        }
    }

    pub fn synced_count(&self) -> u64 {
        self.synced.load(Ordering::Relaxed)
    }

    pub fn requeued_count(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<R, I> EventHandler for SyncWorker<R, I>
where
    R: RecordStore + 'static,
    I: SearchIndex + 'static,
{
    async fn handle(&self, payload: &[u8]) -> Disposition {
        self.process(payload).await
    }
}

/// Bound a dependency call so a hung peer cannot hold the in-flight slot
async fn with_deadline<T, F>(operation: &'static str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| SyncError::timeout(operation, limit.as_millis() as u64))?
}

fn excerpt(payload: &[u8]) -> String {
    let end = payload.len().min(MAX_LOGGED_PAYLOAD);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}
