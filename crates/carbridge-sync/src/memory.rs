//! In-memory queue, record store and search index
//!
//! Used by the worker and pipeline tests. The store and index support
//! failure injection so retry paths run without live dependencies; the
//! queue redelivers requeued payloads like a broker would.

use crate::consumer::dispatch;
use async_trait::async_trait;
use carbridge_core::prelude::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::debug;

/// Operation observed by [`MemorySearchIndex`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOp {
    Delete(String),
    Create(String),
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn pause(delay: &RwLock<Option<Duration>>) {
    let delay = *delay.read().await;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

/// Record store over a hash map keyed by business identifier
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, CanonicalRecord>>,
    failures: AtomicU32,
    delay: RwLock<Option<Duration>>,
    lookups: AtomicU32,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record; the value must be an object with `fzg_id`
    pub async fn put(&self, value: Value) -> Result<()> {
        let record = CanonicalRecord::from_value(value)
            .ok_or_else(|| SyncError::Internal("record must be a JSON object".to_string()))?;
        let id = record
            .identifier()
            .ok_or_else(|| SyncError::Internal("record must carry fzg_id".to_string()))?
            .to_string();
        self.records.write().await.insert(id, record);
        Ok(())
    }

    /// Fail the next `count` lookups
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Delay every lookup
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }

    pub fn lookup_count(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for MemoryRecordStore {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "memory_record_store"
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_by_identifier(&self, id: &str) -> Result<Option<CanonicalRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        pause(&self.delay).await;

        if take_failure(&self.failures) {
            return Err(SyncError::store("store unavailable"));
        }

        Ok(self.records.read().await.get(id).cloned())
    }
}

/// Search index over a hash map of JSON documents
#[derive(Default)]
pub struct MemorySearchIndex {
    documents: RwLock<HashMap<String, Value>>,
    ops: RwLock<Vec<IndexOp>>,
    delete_failures: AtomicU32,
    create_failures: AtomicU32,
    delete_delay: RwLock<Option<Duration>>,
    create_delay: RwLock<Option<Duration>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document without recording an operation
    pub async fn seed(&self, id: &str, document: Value) {
        self.documents.write().await.insert(id.to_string(), document);
    }

    pub async fn get(&self, id: &str) -> Option<Value> {
        self.documents.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    pub async fn ops(&self) -> Vec<IndexOp> {
        self.ops.read().await.clone()
    }

    /// Fail the next `count` deletes with a non-not-found error
    pub fn fail_deletes(&self, count: u32) {
        self.delete_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` creates
    pub fn fail_creates(&self, count: u32) {
        self.create_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every delete after it is recorded
    pub async fn set_delete_delay(&self, delay: Option<Duration>) {
        *self.delete_delay.write().await = delay;
    }

    /// Delay every create after it is recorded
    pub async fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.write().await = delay;
    }
}

#[async_trait]
impl HealthCheck for MemorySearchIndex {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "memory_search_index"
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn delete_by_id(&self, id: &str) -> Result<DeleteOutcome> {
        self.ops.write().await.push(IndexOp::Delete(id.to_string()));
        pause(&self.delete_delay).await;

        if take_failure(&self.delete_failures) {
            return Err(SyncError::index_status("delete failed", 503));
        }

        match self.documents.write().await.remove(id) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn create_with_id(&self, id: &str, document: &SearchDocument) -> Result<()> {
        self.ops.write().await.push(IndexOp::Create(id.to_string()));
        pause(&self.create_delay).await;

        if take_failure(&self.create_failures) {
            return Err(SyncError::index_status("create failed", 503));
        }

        self.documents
            .write()
            .await
            .insert(id.to_string(), document.clone().into_value());
        Ok(())
    }
}

/// Settlement recorded by [`MemoryQueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub disposition: Disposition,
}

type SettlementLog = Arc<Mutex<Vec<Settlement>>>;

struct MemoryAcker {
    delivery_tag: u64,
    payload: Vec<u8>,
    redeliver: mpsc::UnboundedSender<Vec<u8>>,
    log: SettlementLog,
}

impl MemoryAcker {
    fn record(&self, disposition: Disposition) -> Result<()> {
        self.log
            .lock()
            .map_err(|_| SyncError::Internal("settlement log poisoned".to_string()))?
            .push(Settlement {
                delivery_tag: self.delivery_tag,
                payload: self.payload.clone(),
                disposition,
            });
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.record(Disposition::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        if requeue {
            self.record(Disposition::Requeue)?;
            self.redeliver
                .send(self.payload.clone())
                .map_err(|_| SyncError::queue("queue closed"))
        } else {
            self.record(Disposition::Discard)
        }
    }
}

/// FIFO queue with broker-style redelivery of requeued payloads
pub struct MemoryQueue {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    log: SettlementLog,
    next_tag: AtomicU64,
    running: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            log: Arc::new(Mutex::new(Vec::new())),
            next_tag: AtomicU64::new(1),
            running: AtomicBool::new(false),
        }
    }

    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.sender
            .send(payload.into())
            .map_err(|_| SyncError::queue("queue closed"))
    }

    /// Every settlement so far, in order
    pub fn settlements(&self) -> Vec<Settlement> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Lifecycle for MemoryQueue {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for MemoryQueue {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "memory_queue"
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut receiver = self.receiver.lock().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let payload = tokio::select! {
                payload = receiver.recv() => payload,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let Some(payload) = payload else {
                return Err(SyncError::queue("Delivery stream ended"));
            };

            let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            debug!(delivery_tag, "Delivering payload");
            let acker = MemoryAcker {
                delivery_tag,
                payload: payload.clone(),
                redeliver: self.sender.clone(),
                log: self.log.clone(),
            };
            dispatch(handler.as_ref(), &payload, DeliveryHandle::new(delivery_tag, acker)).await?;
        }

        Ok(())
    }
}
