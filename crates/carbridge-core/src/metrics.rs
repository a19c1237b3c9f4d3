//! Metrics for the carbridge sync worker
//!
//! Emits through the `metrics` facade; the binary installs a Prometheus
//! recorder when metrics are enabled.

use crate::message::{Disposition, SyncOutcome};
use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    pub const EVENTS_RECEIVED: &str = "carbridge_events_received_total";
    pub const EVENTS_SETTLED: &str = "carbridge_events_settled_total";
    pub const SYNC_OUTCOMES: &str = "carbridge_sync_outcomes_total";
    pub const SYNC_ERRORS: &str = "carbridge_sync_errors_total";
    pub const SYNC_LATENCY: &str = "carbridge_sync_latency_seconds";
    pub const INDEX_REQUESTS: &str = "carbridge_index_requests_total";
    pub const STORE_LOOKUPS: &str = "carbridge_store_lookups_total";

    pub const CONNECTION_STATE: &str = "connection_state";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const DISPOSITION: &str = "disposition";
    pub const OUTCOME: &str = "outcome";
    pub const OPERATION: &str = "operation";
    pub const ERROR_TYPE: &str = "error_type";
    pub const CONNECTION: &str = "connection";
    pub const STATUS: &str = "status";
}

/// Worker metrics
#[derive(Clone)]
pub struct SyncMetrics {
    component: String,
}

impl SyncMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn record_received(&self) {
        counter!(
            names::EVENTS_RECEIVED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    pub fn record_disposition(&self, disposition: Disposition) {
        counter!(
            names::EVENTS_SETTLED,
            labels::COMPONENT => self.component.clone(),
            labels::DISPOSITION => disposition.as_str(),
        )
        .increment(1);
    }

    pub fn record_outcome(&self, outcome: SyncOutcome) {
        counter!(
            names::SYNC_OUTCOMES,
            labels::COMPONENT => self.component.clone(),
            labels::OUTCOME => outcome.as_str(),
        )
        .increment(1);
    }

    pub fn record_error(&self, error_type: &'static str) {
        counter!(
            names::SYNC_ERRORS,
            labels::COMPONENT => self.component.clone(),
            labels::ERROR_TYPE => error_type,
        )
        .increment(1);
    }

    pub fn record_latency(&self, duration: Duration) {
        histogram!(
            names::SYNC_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record one index request (`delete`/`create`) with its result label
    pub fn record_index_request(&self, operation: &'static str, status: &'static str) {
        counter!(
            names::INDEX_REQUESTS,
            labels::COMPONENT => self.component.clone(),
            labels::OPERATION => operation,
            labels::STATUS => status,
        )
        .increment(1);
    }

    /// Record one store lookup (`found`/`absent`/`error`)
    pub fn record_lookup(&self, status: &'static str) {
        counter!(
            names::STORE_LOOKUPS,
            labels::COMPONENT => self.component.clone(),
            labels::STATUS => status,
        )
        .increment(1);
    }
}

/// Connection metrics
#[derive(Clone)]
pub struct ConnectionMetrics {
    connection_name: String,
}

impl ConnectionMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            connection_name: name.into(),
        }
    }

    /// Set connection state (1 = connected, 0 = disconnected)
    pub fn set_connected(&self, connected: bool) {
        gauge!(
            names::CONNECTION_STATE,
            labels::CONNECTION => self.connection_name.clone(),
        )
        .set(if connected { 1.0 } else { 0.0 });
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_timer_records_once() {
        let mut calls = 0;
        {
            let timer = LatencyTimer::start(|_| calls += 1);
            std::thread::sleep(Duration::from_millis(5));
            assert!(timer.stop() >= Duration::from_millis(5));
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        let metrics = SyncMetrics::new("test");
        metrics.record_received();
        metrics.record_disposition(Disposition::Ack);
        metrics.record_outcome(SyncOutcome::RecordAbsent);
        metrics.record_index_request("delete", "not_found");
        ConnectionMetrics::new("record_store").set_connected(true);
    }
}
