//! Error types for the carbridge sync worker
//!
//! Uses `thiserror`; every variant maps onto exactly one queue disposition
//! through [`SyncError::disposition`].

use crate::message::Disposition;
use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Primary error type for all sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Inbound payload could not be parsed or carries no identifier
    #[error("Malformed event: {message}")]
    MalformedEvent {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Record store lookup or connectivity errors
    #[error("Record store error: {message}")]
    RecordStore {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Search index request errors (anything other than a tolerated not-found)
    #[error("Search index error: {message}")]
    SearchIndex {
        message: String,
        status: Option<u16>,
        #[source]
        source: Option<BoxError>,
    },

    /// Queue connection, topology or acknowledgement errors
    #[error("Queue error: {message}")]
    Queue {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Operation timeout
    #[error("Timeout: {operation} exceeded {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a malformed event error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEvent {
            message: message.into(),
            source: None,
        }
    }

    /// Create a malformed event error with source
    pub fn malformed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::MalformedEvent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a record store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::RecordStore {
            message: message.into(),
            source: None,
        }
    }

    /// Create a record store error with source
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::RecordStore {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a search index error from an unexpected HTTP status
    pub fn index_status(message: impl Into<String>, status: u16) -> Self {
        Self::SearchIndex {
            message: message.into(),
            status: Some(status),
            source: None,
        }
    }

    /// Create a search index error with source
    pub fn index_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SearchIndex {
            message: message.into(),
            status: None,
            source: Some(Box::new(source)),
        }
    }

    /// Create a queue error
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
            source: None,
        }
    }

    /// Create a queue error with source
    pub fn queue_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Queue {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Check if error is retryable
    ///
    /// Only input and configuration problems are permanent. Anything not
    /// explicitly classified counts as retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::MalformedEvent { .. } | Self::Configuration { .. })
    }

    /// Queue disposition for an event whose processing failed with this error
    pub fn disposition(&self) -> Disposition {
        if self.is_retryable() {
            Disposition::Requeue
        } else {
            Disposition::Discard
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEvent { .. } => "malformed_event",
            Self::RecordStore { .. } => "record_store",
            Self::SearchIndex { .. } => "search_index",
            Self::Queue { .. } => "queue",
            Self::Configuration { .. } => "configuration",
            Self::Timeout { .. } => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}
