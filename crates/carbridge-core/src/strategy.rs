//! Seam traits for the carbridge sync worker
//!
//! Every external collaborator sits behind one of these traits so the
//! orchestration can run against in-memory implementations in tests.
//!
//! ```text
//! QueueConsumer ──► EventHandler (SyncWorker) ──► RecordStore
//!       ▲                    │
//!       │                    └──────────────────► SearchIndex
//!       └── DeliveryHandle::settle(Disposition)
//! ```

use crate::error::{Result, SyncError};
use crate::message::{DeleteOutcome, Disposition};
use crate::record::{CanonicalRecord, SearchDocument};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

// ============================================================================
// Lifecycle Management
// ============================================================================

/// Lifecycle management for components
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start the component
    ///
    /// Called once before any operations. Establishes connections and
    /// declares whatever topology the component needs.
    async fn start(&self) -> Result<()>;

    /// Stop the component gracefully
    ///
    /// May be called even if start() failed.
    async fn stop(&self) -> Result<()>;

    /// Check if the component is running
    fn is_running(&self) -> bool;
}

/// Health check capability
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Returns Ok(()) if healthy, Err with details if not.
    async fn health_check(&self) -> Result<()>;

    /// Get component name for health reporting
    fn component_name(&self) -> &'static str;
}

// ============================================================================
// Dependency Adapters
// ============================================================================

/// Read access to canonical records
///
/// Implementations must not retry; an absent record is `Ok(None)`, never an
/// error.
#[async_trait]
pub trait RecordStore: HealthCheck {
    async fn find_by_identifier(&self, id: &str) -> Result<Option<CanonicalRecord>>;
}

/// Per-document mutations against the search index
///
/// `delete_by_id` distinguishes a missing target from a failed request;
/// neither operation retries.
#[async_trait]
pub trait SearchIndex: HealthCheck {
    async fn delete_by_id(&self, id: &str) -> Result<DeleteOutcome>;

    async fn create_with_id(&self, id: &str, document: &SearchDocument) -> Result<()>;
}

// ============================================================================
// Delivery Handling
// ============================================================================

/// Transport-level acknowledgement primitives for one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// Opaque reference to one in-flight delivery
///
/// Every disposition method takes `self`, so a handle can be settled at most
/// once. A handle dropped unsettled stays unacknowledged and is redelivered
/// by the broker once the channel closes.
pub struct DeliveryHandle {
    delivery_tag: u64,
    acker: Option<Box<dyn Acknowledger>>,
}

impl DeliveryHandle {
    pub fn new(delivery_tag: u64, acker: impl Acknowledger + 'static) -> Self {
        Self {
            delivery_tag,
            acker: Some(Box::new(acker)),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Mark the message permanently consumed
    pub async fn acknowledge(self) -> Result<()> {
        self.settle(Disposition::Ack).await
    }

    /// Transient failure; the broker redelivers
    pub async fn reject_requeue(self) -> Result<()> {
        self.settle(Disposition::Requeue).await
    }

    /// Permanent failure; the broker must not redeliver
    pub async fn reject_discard(self) -> Result<()> {
        self.settle(Disposition::Discard).await
    }

    pub async fn settle(mut self, disposition: Disposition) -> Result<()> {
        let acker = self
            .acker
            .take()
            .ok_or_else(|| SyncError::Internal("delivery already settled".to_string()))?;

        match disposition {
            Disposition::Ack => acker.ack().await,
            Disposition::Requeue => acker.reject(true).await,
            Disposition::Discard => acker.reject(false).await,
        }
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        if self.acker.is_some() {
            warn!(
                delivery_tag = self.delivery_tag,
                "Delivery dropped without a disposition"
            );
        }
    }
}

impl std::fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("delivery_tag", &self.delivery_tag)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

/// Processes one delivered payload and decides its disposition
///
/// Handlers never touch the [`DeliveryHandle`]; the consumer settles it with
/// the returned value.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Disposition;
}

/// Inbound queue subscription
#[async_trait]
pub trait QueueConsumer: Lifecycle + HealthCheck {
    /// Deliver events to `handler` one at a time until `shutdown` flips
    ///
    /// Shutdown is only observed between deliveries; an event already handed
    /// to the handler is always settled first.
    async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}
