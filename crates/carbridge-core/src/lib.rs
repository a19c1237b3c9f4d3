//! # Carbridge Core
//!
//! Core types, seam traits and configuration for the carbridge sync worker.
//!
//! The worker keeps a search index eventually consistent with a document
//! store. One inbound change event names one record; the worker resolves it,
//! projects it and fully replaces its index entry.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────┐     ┌─────────────┐
//! │QueueConsumer │────►│ SyncWorker │────►│ RecordStore │
//! │ (ack / nack) │◄────│            │     └─────────────┘
//! └──────────────┘     │            │     ┌─────────────┐
//!                      │            │────►│ SearchIndex │
//!                      └────────────┘     └─────────────┘
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod record;
pub mod strategy;

pub use crate::config::*;
pub use error::*;
pub use message::*;
pub use crate::metrics::{ConnectionMetrics, LatencyTimer, SyncMetrics};
pub use record::*;
pub use strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::BridgeConfig;
    pub use crate::error::{Result, SyncError};
    pub use crate::message::{ChangeEvent, DeleteOutcome, Disposition, SyncOutcome};
    pub use crate::record::{CanonicalRecord, SearchDocument};
    pub use crate::strategy::{
        Acknowledger, DeliveryHandle, EventHandler, HealthCheck, Lifecycle, QueueConsumer,
        RecordStore, SearchIndex,
    };
}
