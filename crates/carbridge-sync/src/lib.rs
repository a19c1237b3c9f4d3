//! # Carbridge Sync
//!
//! Consumes car change events from RabbitMQ, reads the current record from
//! MongoDB and replaces the matching document in Elasticsearch.
//!
//! ## Adapters
//!
//! - `AmqpConsumer`: topic exchange consumer, prefetch-limited, manual acks
//! - `MongoRecordStore`: `find_one` by business identifier
//! - `HttpSearchIndex`: document delete and create over the REST API
//!
//! ## Processing
//!
//! One event at a time: parse, look up, delete, create. Any failure after
//! parsing requeues the delivery; a malformed payload is discarded.

pub mod consumer;
pub mod memory;
pub mod record_store;
pub mod search_index;
pub mod service;
pub mod worker;

pub use consumer::{dispatch, AmqpConsumer, LapinAcknowledger};
pub use record_store::MongoRecordStore;
pub use search_index::HttpSearchIndex;
pub use service::{run_pipeline, shutdown_signal, watch_health, Bridge};
pub use worker::SyncWorker;
