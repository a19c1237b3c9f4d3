//! Message types for the carbridge sync worker
//!
//! Defines the inbound change event, the per-delivery disposition and the
//! outcomes reported by the index and the worker.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound change notification naming a record that needs re-synchronization
///
/// Wire format: `{ "id": "<fzg_id>" }`. Extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Business identifier (`fzg_id`) of the affected record
    pub id: String,
}

impl ChangeEvent {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Parse and validate a raw queue payload
    ///
    /// Fails with [`SyncError::MalformedEvent`] for non-JSON bodies, bodies
    /// that are not an object with a string `id`, blank identifiers and the
    /// dot-segment identifiers `.` and `..`, which no document URL can address.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| SyncError::malformed_with_source("Payload is not valid JSON", e))?;

        let Value::Object(fields) = value else {
            return Err(SyncError::malformed("Payload is not a JSON object"));
        };

        let id = fields
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::malformed("No proper fzg_id set"))?;

        if id.trim().is_empty() {
            return Err(SyncError::malformed("No proper fzg_id set"));
        }
        if id == "." || id == ".." {
            return Err(SyncError::malformed(format!("fzg_id {:?} is not addressable", id)));
        }

        Ok(Self::new(id))
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Terminal disposition of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Permanently consumed, never redelivered
    Ack,
    /// Transient failure, redeliver for another attempt
    Requeue,
    /// Permanent failure, dead-letter or drop per queue configuration
    Discard,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::Discard => "discard",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a tolerant index delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Nothing to delete; expected on first sync
    NotFound,
}

/// Result of one successful synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Index entry fully replaced with the current projection
    Replaced { previous: DeleteOutcome },
    /// No record exists for the identifier; index left untouched
    RecordAbsent,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replaced { previous: DeleteOutcome::Deleted } => "replaced",
            Self::Replaced { previous: DeleteOutcome::NotFound } => "created",
            Self::RecordAbsent => "record_absent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_event() {
        let event = ChangeEvent::parse(br#"{"id":"X1"}"#).unwrap();
        assert_eq!(event.id, "X1");
    }

    #[test]
    fn test_parse_keeps_dotted_identifiers() {
        assert_eq!(ChangeEvent::parse(br#"{"id":"a.b"}"#).unwrap().id, "a.b");
        assert_eq!(ChangeEvent::parse(br#"{"id":"..."}"#).unwrap().id, "...");
    }

    #[test]
    fn test_parse_tolerates_extra_fields() {
        let event = ChangeEvent::parse(br#"{"id":"X1","source":"bc"}"#).unwrap();
        assert_eq!(event, ChangeEvent::new("X1"));
    }

    #[test]
    fn test_parse_rejects_malformed_payloads() {
        let payloads: [&[u8]; 11] = [
            b"",
            b"not json",
            b"{}",
            br#"{"id":""}"#,
            br#"{"id":"   "}"#,
            br#"{"id":42}"#,
            br#"["X1"]"#,
            br#""X1""#,
            b"null",
            br#"{"id":"."}"#,
            br#"{"id":".."}"#,
        ];

        for payload in payloads {
            let err = ChangeEvent::parse(payload).unwrap_err();
            assert!(
                matches!(err, SyncError::MalformedEvent { .. }),
                "payload {:?} should be malformed",
                String::from_utf8_lossy(payload)
            );
            assert_eq!(err.disposition(), Disposition::Discard);
        }
    }

    #[test]
    fn test_sync_outcome_labels() {
        assert_eq!(SyncOutcome::RecordAbsent.as_str(), "record_absent");
        assert_eq!(
            SyncOutcome::Replaced { previous: DeleteOutcome::NotFound }.as_str(),
            "created"
        );
    }
}
