//! MongoDB record store
//!
//! Implements the RecordStore strategy: one `find_one` by business
//! identifier per event, converted from BSON into the open JSON field set of
//! a [`CanonicalRecord`].

use async_trait::async_trait;
use carbridge_core::prelude::*;
use carbridge_core::{ConnectionMetrics, StoreConfig};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, Database};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace};

/// Record store backed by one MongoDB collection
pub struct MongoRecordStore {
    database: Database,
    collection: Collection<Document>,
    identifier_field: String,
    metrics: ConnectionMetrics,
    running: AtomicBool,
}

impl MongoRecordStore {
    /// Build the client from configuration
    ///
    /// The driver connects lazily; [`Lifecycle::start`] verifies the server
    /// is reachable.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let uri = config
            .connection_uri()
            .ok_or_else(|| SyncError::config("store.host is not set"))?;

        let mut options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| SyncError::store_with_source("Invalid connection string", e))?;
        options.app_name = Some("carbridge-sync".to_string());
        options.connect_timeout = Some(config.connect_timeout);
        options.server_selection_timeout = Some(config.server_selection_timeout);

        let client = Client::with_options(options)
            .map_err(|e| SyncError::store_with_source("Failed to create client", e))?;

        Ok(Self::from_client(&client, config))
    }

    /// Reuse an existing client handle
    pub fn from_client(client: &Client, config: &StoreConfig) -> Self {
        let database = client.database(&config.database);
        let collection = database.collection::<Document>(&config.collection);

        Self {
            database,
            collection,
            identifier_field: config.identifier_field.clone(),
            metrics: ConnectionMetrics::new("record_store"),
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Lifecycle for MongoRecordStore {
    async fn start(&self) -> Result<()> {
        info!(
            database = %self.database.name(),
            collection = %self.collection.name(),
            "Connecting to MongoDB"
        );
        self.health_check().await?;
        self.running.store(true, Ordering::SeqCst);
        info!("Connected to MongoDB");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.metrics.set_connected(false);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for MongoRecordStore {
    async fn health_check(&self) -> Result<()> {
        let result = self
            .database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map(|_| ())
            .map_err(|e| SyncError::store_with_source("Ping failed", e));

        self.metrics.set_connected(result.is_ok());
        result
    }

    fn component_name(&self) -> &'static str {
        "record_store"
    }
}

#[async_trait]
impl RecordStore for MongoRecordStore {
    async fn find_by_identifier(&self, id: &str) -> Result<Option<CanonicalRecord>> {
        let mut filter = Document::new();
        filter.insert(self.identifier_field.clone(), id);
        trace!(?filter, "Looking up record");

        let found = self
            .collection
            .find_one(filter, None)
            .await
            .map_err(|e| SyncError::store_with_source("Lookup failed", e))?;

        debug!(fzg_id = %id, found = found.is_some(), "Record lookup finished");
        Ok(found.map(document_to_record))
    }
}

/// Convert a stored document into a canonical record
pub fn document_to_record(document: Document) -> CanonicalRecord {
    CanonicalRecord::new(document_to_map(document))
}

fn document_to_map(document: Document) -> Map<String, Value> {
    document
        .into_iter()
        .map(|(key, value)| (key, bson_to_json(value)))
        .collect()
}

/// BSON to plain JSON as the index expects it
///
/// ObjectIds become hex strings and dates RFC 3339 strings; everything else
/// uses relaxed extended JSON.
pub fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Document(document) => Value::Object(document_to_map(document)),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or_else(|_| Value::from(dt.timestamp_millis())),
        other => other.into_relaxed_extjson(),
    }
}
