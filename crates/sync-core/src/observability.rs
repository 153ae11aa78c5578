//! Observability infrastructure for the sync core
//!
//! Provides:
//! - Prometheus metrics (queue depth, deliveries, drain latency, cache hit
//!   rate, rate-limit rejections, reconnects, session refreshes)
//! - Structured JSON logging with tracing, which doubles as the default
//!   [`ErrorSink`]

use crate::error::ErrorCategory;
use crate::sink::{ErrorReport, ErrorSink};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for drain latency (in seconds)
const DRAIN_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SyncMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct SyncMetricsInner {
    queue_depth: IntGauge,
    dead_letters: IntGauge,
    operations_delivered: IntCounter,
    operations_failed: IntCounterVec,
    drain_latency_seconds: Histogram,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    rate_limited: IntCounterVec,
    realtime_reconnects: IntCounter,
    active_channels: IntGauge,
    session_refreshes: IntCounterVec,
}

impl SyncMetricsInner {
    fn new() -> Self {
        Self {
            queue_depth: register_int_gauge!(
                "sync_queue_depth",
                "Number of pending operations in the sync queue"
            )
            .expect("Failed to register sync_queue_depth"),

            dead_letters: register_int_gauge!(
                "sync_queue_dead_letters",
                "Number of operations parked in the dead-letter log"
            )
            .expect("Failed to register sync_queue_dead_letters"),

            operations_delivered: register_int_counter!(
                "sync_operations_delivered_total",
                "Operations confirmed by the backend"
            )
            .expect("Failed to register sync_operations_delivered_total"),

            operations_failed: register_int_counter_vec!(
                "sync_operation_failures_total",
                "Failed operation attempts by error category",
                &["category"]
            )
            .expect("Failed to register sync_operation_failures_total"),

            drain_latency_seconds: register_histogram!(
                "sync_drain_latency_seconds",
                "Time spent in a single queue drain pass",
                DRAIN_BUCKETS.to_vec()
            )
            .expect("Failed to register sync_drain_latency_seconds"),

            cache_hits: register_int_counter!("sync_cache_hits_total", "Cache reads served")
                .expect("Failed to register sync_cache_hits_total"),

            cache_misses: register_int_counter!(
                "sync_cache_misses_total",
                "Cache reads that were absent, stale or incompatible"
            )
            .expect("Failed to register sync_cache_misses_total"),

            rate_limited: register_int_counter_vec!(
                "sync_rate_limited_total",
                "Requests rejected by the client-side rate limiter",
                &["action"]
            )
            .expect("Failed to register sync_rate_limited_total"),

            realtime_reconnects: register_int_counter!(
                "sync_realtime_reconnects_total",
                "Realtime channel reconnection attempts"
            )
            .expect("Failed to register sync_realtime_reconnects_total"),

            active_channels: register_int_gauge!(
                "sync_realtime_active_channels",
                "Realtime channels currently subscribed"
            )
            .expect("Failed to register sync_realtime_active_channels"),

            session_refreshes: register_int_counter_vec!(
                "sync_session_refreshes_total",
                "Session refresh outcomes",
                &["outcome"]
            )
            .expect("Failed to register sync_session_refreshes_total"),
        }
    }
}

/// Sync metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct SyncMetrics {
    _private: (),
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SyncMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SyncMetricsInner {
        GLOBAL_METRICS.get_or_init(SyncMetricsInner::new)
    }

    pub fn set_queue_depth(&self, pending: usize, dead: usize) {
        self.inner().queue_depth.set(pending as i64);
        self.inner().dead_letters.set(dead as i64);
    }

    pub fn inc_delivered(&self) {
        self.inner().operations_delivered.inc();
    }

    pub fn inc_failure(&self, category: ErrorCategory) {
        self.inner()
            .operations_failed
            .with_label_values(&[&category.to_string()])
            .inc();
    }

    pub fn observe_drain_latency(&self, duration_secs: f64) {
        self.inner().drain_latency_seconds.observe(duration_secs);
    }

    pub fn inc_cache_hit(&self) {
        self.inner().cache_hits.inc();
    }

    pub fn inc_cache_miss(&self) {
        self.inner().cache_misses.inc();
    }

    pub fn inc_rate_limited(&self, action: &str) {
        self.inner().rate_limited.with_label_values(&[action]).inc();
    }

    pub fn inc_realtime_reconnect(&self) {
        self.inner().realtime_reconnects.inc();
    }

    pub fn set_active_channels(&self, count: usize) {
        self.inner().active_channels.set(count as i64);
    }

    pub fn inc_session_refresh(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.inner()
            .session_refreshes
            .with_label_values(&[outcome])
            .inc();
    }
}

/// Structured logger for sync lifecycle events
///
/// Provides consistent JSON-formatted logging for deliveries, dead letters,
/// connectivity and session changes. Also acts as the default error sink.
#[derive(Clone)]
pub struct StructuredLogger {
    device_id: String,
}

impl StructuredLogger {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, pending: usize) {
        info!(
            event = "sync_agent_started",
            device = %self.device_id,
            version = %version,
            pending_operations = pending,
            "Sync agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "sync_agent_shutdown",
            device = %self.device_id,
            reason = %reason,
            "Sync agent shutting down"
        );
    }

    /// Log a completed drain pass
    pub fn log_drain(&self, trigger: &str, delivered: usize, deferred: usize, dead: usize) {
        info!(
            event = "queue_drained",
            device = %self.device_id,
            trigger = %trigger,
            delivered = delivered,
            deferred = deferred,
            dead_lettered = dead,
            "Sync queue drain complete"
        );
    }

    /// Log connectivity changes
    pub fn log_connectivity(&self, online: bool, pending: usize) {
        if online {
            info!(
                event = "connectivity",
                device = %self.device_id,
                online = true,
                pending_operations = pending,
                "Back online, draining queued operations"
            );
        } else {
            warn!(
                event = "connectivity",
                device = %self.device_id,
                online = false,
                pending_operations = pending,
                "Offline, queueing operations locally"
            );
        }
    }
}

impl ErrorSink for StructuredLogger {
    fn report(&self, report: ErrorReport) {
        let context = serde_json::to_string(&report.context).unwrap_or_default();
        match report.category {
            ErrorCategory::TransientNetwork | ErrorCategory::RateLimitExceeded => {
                warn!(
                    event = "sync_error",
                    device = %self.device_id,
                    category = %report.category,
                    context = %context,
                    "{}",
                    report.message
                );
            }
            _ => {
                error!(
                    event = "sync_error",
                    device = %self.device_id,
                    category = %report.category,
                    context = %context,
                    "{}",
                    report.message
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_metrics_creation() {
        // Metrics live in the global Prometheus registry; repeated handles share it.
        let metrics = SyncMetrics::new();
        let again = SyncMetrics::new();

        metrics.set_queue_depth(3, 1);
        metrics.inc_delivered();
        metrics.inc_failure(ErrorCategory::TransientNetwork);
        metrics.observe_drain_latency(0.02);
        again.inc_cache_hit();
        again.inc_cache_miss();
        again.inc_rate_limited("booking");
        again.inc_session_refresh(true);
    }

    #[test]
    fn test_structured_logger_reports_without_panicking() {
        let logger = StructuredLogger::new("device-1");
        assert_eq!(logger.device_id(), "device-1");
        logger.report(ErrorReport::new(ErrorCategory::Storage, "disk full").with("key", "k"));
    }
}
