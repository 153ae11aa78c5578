//! Durable, priority-ordered mutation queue
//!
//! This module provides:
//! - Synchronous, durable `enqueue` (persisted before it returns)
//! - Single-flight drains that deliver by priority, then insertion order
//! - Per-record backoff between attempts and dead-lettering after
//!   `max_retries`
//! - Background drain scheduling on startup, timer and connectivity triggers
//!
//! Delivery is at-least-once: a record leaves the store only after the
//! executor confirms it, so a crash or cancelled drain re-submits it later.

mod operation;
mod scheduler;


pub use operation::{OperationAction, OperationKind, OperationStatus, QueuedOperation};
pub use scheduler::{DrainScheduler, DrainTrigger};

use crate::clock::{chrono_duration, Clock};
use crate::error::{ErrorCategory, Result, StoreError, SyncError};
use crate::flight::SingleFlight;
use crate::observability::{StructuredLogger, SyncMetrics};
use crate::retry::RetryConfig;
use crate::session::CredentialRefresher;
use crate::sink::{ErrorReport, ErrorSink};
use crate::store::{put_json, DurableStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

const PENDING_PREFIX: &str = "queue/pending/";
const DEAD_PREFIX: &str = "queue/dead/";

fn pending_key(id: &str) -> String {
    format!("{}{}", PENDING_PREFIX, id)
}

fn dead_key(id: &str) -> String {
    format!("{}{}", DEAD_PREFIX, id)
}

/// Performs the remote mutation for a queued operation
///
/// Implementations must tolerate re-submission of an operation that may
/// already have been applied; [`QueuedOperation::idempotency_key`] is stable
/// across attempts.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, operation: &QueuedOperation) -> Result<()>;
}

/// Configuration for the sync queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Backoff between attempts of one record; `max_retries` bounds attempts
    pub retry: RetryConfig,
    /// Period of the background drain timer
    pub drain_interval: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::backend(),
            drain_interval: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

/// Terminal and delivery events emitted by drains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Delivered {
        id: String,
        kind: OperationKind,
        attempts: u32,
    },
    DeadLettered {
        id: String,
        kind: OperationKind,
        attempts: u32,
        category: ErrorCategory,
        last_error: String,
    },
    /// The record could not be read or persisted and was discarded
    Dropped { id: String, reason: String },
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub delivered: usize,
    /// Failed attempts that were rescheduled
    pub failed: usize,
    pub dead_lettered: usize,
    /// Pending records left waiting on backoff
    pub deferred: usize,
    pub dropped: usize,
    /// The drain stopped because the gate is paused
    pub paused: bool,
    /// Time until the earliest deferred record becomes eligible
    #[serde(with = "duration_millis_opt")]
    pub next_eligible_in: Option<Duration>,
}

/// Snapshot of queue contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub deferred: usize,
    pub dead_letters: usize,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// Pause switch for drains
///
/// Shared between the queue and the session manager: an expired session
/// pauses drains until the user signs in again.
#[derive(Debug, Clone)]
pub struct DrainGate {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for DrainGate {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            paused: Arc::new(tx),
        }
    }

    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!("Sync queue drains paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!("Sync queue drains resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Watch pause state changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }
}

/// Durable sync queue
pub struct SyncQueue {
    store: Arc<dyn DurableStore>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    gate: DrainGate,
    sink: Arc<dyn ErrorSink>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    flight: SingleFlight<Result<DrainReport>>,
    /// Serializes every store mutation made by the queue
    write_lock: Mutex<()>,
    next_seq: AtomicU64,
    events: broadcast::Sender<QueueEvent>,
    metrics: SyncMetrics,
}

enum Attempt {
    Delivered,
    Failed(SyncError),
    /// Credentials could not be refreshed
    RefreshFailed(SyncError),
}

impl SyncQueue {
    /// Open the queue over `store`
    pub fn new(
        store: Arc<dyn DurableStore>,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Result<Self> {
        let next_seq = store
            .list_prefix(PENDING_PREFIX)?
            .into_iter()
            .chain(store.list_prefix(DEAD_PREFIX)?)
            .filter_map(|(_, bytes)| serde_json::from_slice::<QueuedOperation>(&bytes).ok())
            .map(|op| op.seq + 1)
            .max()
            .unwrap_or(0);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Self {
            store,
            executor,
            clock,
            config,
            gate: DrainGate::new(),
            sink: Arc::new(StructuredLogger::new("local")),
            refresher: None,
            flight: SingleFlight::new(),
            write_lock: Mutex::new(()),
            next_seq: AtomicU64::new(next_seq),
            events,
            metrics: SyncMetrics::new(),
        })
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_gate(mut self, gate: DrainGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn gate(&self) -> &DrainGate {
        &self.gate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        self.flight.is_in_flight()
    }

    /// Persist a new mutation and return its id
    pub fn enqueue(
        &self,
        kind: OperationKind,
        resource: impl Into<String>,
        action: OperationAction,
        payload: serde_json::Value,
    ) -> Result<String> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let op = QueuedOperation::new(kind, resource, action, payload, self.clock.now(), seq);

        {
            let _guard = self.write_guard();
            put_json(self.store.as_ref(), &pending_key(&op.id), &op)?;
        }

        debug!(
            operation_id = %op.id,
            kind = %op.kind,
            resource = %op.resource,
            "Operation enqueued"
        );
        self.refresh_depth();
        Ok(op.id)
    }

    /// Deliver every eligible record
    ///
    /// Concurrent callers join the drain already running and receive its
    /// report.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.flight
            .run(|| self.drain_pass())
            .await
            .map_err(|_| SyncError::Cancelled)?
    }

    /// Return records left in flight by a crash to pending
    pub fn recover(&self) -> Result<usize> {
        let _guard = self.write_guard();
        self.reset_in_flight()
    }

    /// Pending and in-flight records, in drain order
    pub fn pending(&self) -> Result<Vec<QueuedOperation>> {
        let mut ops = self.load(PENDING_PREFIX)?;
        ops.sort_by(|a, b| a.drain_order(b));
        Ok(ops)
    }

    /// Dead-lettered records, oldest first
    pub fn dead_letters(&self) -> Result<Vec<QueuedOperation>> {
        let mut ops = self.load(DEAD_PREFIX)?;
        ops.sort_by(|a, b| (a.created_at, a.seq).cmp(&(b.created_at, b.seq)));
        Ok(ops)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let now = self.clock.now();
        let pending = self.load(PENDING_PREFIX)?;
        let dead_letters = self.store.list_prefix(DEAD_PREFIX)?.len();

        Ok(QueueStats {
            pending: pending.len(),
            in_flight: pending
                .iter()
                .filter(|op| op.status == OperationStatus::InFlight)
                .count(),
            deferred: pending
                .iter()
                .filter(|op| op.status == OperationStatus::Pending && !op.is_eligible(now))
                .count(),
            dead_letters,
            oldest_pending_at: pending.iter().map(|op| op.created_at).min(),
        })
    }

    /// Move a dead letter back to the active queue with a fresh retry budget
    pub fn resubmit(&self, id: &str) -> Result<()> {
        {
            let _guard = self.write_guard();
            let key = dead_key(id);
            let Some(bytes) = self.store.get(&key)? else {
                return Err(SyncError::NotFound(id.to_string()));
            };
            let mut op: QueuedOperation =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::codec(key.as_str(), e))?;

            op.status = OperationStatus::Pending;
            op.attempt_count = 0;
            op.next_eligible_at = None;
            op.last_error = None;
            put_json(self.store.as_ref(), &pending_key(id), &op)?;
            self.store.delete(&key)?;
        }

        info!(operation_id = %id, "Dead letter resubmitted");
        self.refresh_depth();
        Ok(())
    }

    /// Discard every dead letter, returning how many were removed
    pub fn purge_dead_letters(&self) -> Result<usize> {
        let purged = {
            let _guard = self.write_guard();
            let keys = self.store.list_prefix(DEAD_PREFIX)?;
            for (key, _) in &keys {
                self.store.delete(key)?;
            }
            keys.len()
        };

        info!(purged = purged, "Dead letters purged");
        self.refresh_depth();
        Ok(purged)
    }

    async fn drain_pass(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        if self.gate.is_paused() {
            report.paused = true;
            return Ok(report);
        }

        let started = tokio::time::Instant::now();
        {
            // Any in-flight record belongs to a cancelled drain; no other
            // drain can be running here.
            let _guard = self.write_guard();
            self.reset_in_flight()?;
        }

        loop {
            if self.gate.is_paused() {
                report.paused = true;
                break;
            }

            // Re-read every iteration so records enqueued mid-drain at a
            // higher priority overtake older ones.
            let now = self.clock.now();
            let pending = self.load_for_drain(&mut report)?;
            let Some(next) = pending
                .into_iter()
                .filter(|op| op.is_eligible(now))
                .min_by(|a, b| a.drain_order(b))
            else {
                break;
            };

            self.deliver(next, &mut report).await;
        }

        let now = self.clock.now();
        let waiting: Vec<_> = self
            .load(PENDING_PREFIX)?
            .into_iter()
            .filter(|op| !op.is_eligible(now))
            .collect();
        report.deferred = waiting.len();
        report.next_eligible_in = waiting
            .iter()
            .filter_map(|op| op.next_eligible_at)
            .min()
            .map(|at| (at - now).to_std().unwrap_or_default());

        self.metrics
            .observe_drain_latency(started.elapsed().as_secs_f64());
        self.refresh_depth();
        Ok(report)
    }

    async fn deliver(&self, mut op: QueuedOperation, report: &mut DrainReport) {
        op.status = OperationStatus::InFlight;
        op.last_attempt_at = Some(self.clock.now());
        if let Err(e) = self.persist_pending(&op) {
            self.drop_record(&op.id, &e, report);
            return;
        }

        match self.attempt(&op).await {
            Attempt::Delivered => self.complete(op, report),
            Attempt::Failed(e) => self.fail(op, e, report),
            // A paused gate means the session expired; the record waits for
            // the next sign-in without spending its retry budget.
            Attempt::RefreshFailed(_) if self.gate.is_paused() => {
                op.status = OperationStatus::Pending;
                if let Err(e) = self.persist_pending(&op) {
                    self.drop_record(&op.id, &e, report);
                }
                report.paused = true;
            }
            Attempt::RefreshFailed(e) => self.fail(op, e, report),
        }
    }

    async fn attempt(&self, op: &QueuedOperation) -> Attempt {
        match self.execute_once(op).await {
            Ok(()) => Attempt::Delivered,
            Err(SyncError::AuthExpired) => {
                let Some(refresher) = &self.refresher else {
                    return Attempt::Failed(SyncError::AuthExpired);
                };
                debug!(operation_id = %op.id, "Credentials expired, refreshing before retry");
                if let Err(e) = refresher.refresh_credentials().await {
                    warn!(operation_id = %op.id, error = %e, "Credential refresh failed");
                    return Attempt::RefreshFailed(e);
                }
                match self.execute_once(op).await {
                    Ok(()) => Attempt::Delivered,
                    Err(e) => Attempt::Failed(e),
                }
            }
            Err(e) => Attempt::Failed(e),
        }
    }

    async fn execute_once(&self, op: &QueuedOperation) -> Result<()> {
        let timeout = self.config.retry.timeout;
        match tokio::time::timeout(timeout, self.executor.execute(op)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(timeout)),
        }
    }

    fn complete(&self, op: QueuedOperation, report: &mut DrainReport) {
        let removed = {
            let _guard = self.write_guard();
            self.store.delete(&pending_key(&op.id))
        };
        if let Err(e) = removed {
            // Stays in flight and is re-submitted by the next drain.
            error!(operation_id = %op.id, error = %e, "Failed to remove delivered operation");
        }

        let attempts = op.attempt_count + 1;
        debug!(operation_id = %op.id, kind = %op.kind, attempts = attempts, "Operation delivered");
        report.delivered += 1;
        self.metrics.inc_delivered();
        let _ = self.events.send(QueueEvent::Delivered {
            id: op.id,
            kind: op.kind,
            attempts,
        });
    }

    fn fail(&self, mut op: QueuedOperation, err: SyncError, report: &mut DrainReport) {
        self.metrics.inc_failure(err.category());
        if let SyncError::Storage(store_err) = &err {
            self.drop_record(&op.id, store_err, report);
            return;
        }

        op.attempt_count += 1;
        op.last_error = Some(err.to_string());

        if !err.is_retryable() || op.attempt_count > self.config.retry.max_retries {
            self.dead_letter(op, err, report);
            return;
        }

        let delay = self.config.retry.backoff_delay(op.attempt_count);
        op.status = OperationStatus::Pending;
        op.next_eligible_at = Some(self.clock.now() + chrono_duration(delay));
        warn!(
            operation_id = %op.id,
            kind = %op.kind,
            attempt = op.attempt_count,
            max_retries = self.config.retry.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Operation failed, rescheduling"
        );

        match self.persist_pending(&op) {
            Ok(()) => report.failed += 1,
            Err(e) => self.drop_record(&op.id, &e, report),
        }
    }

    fn dead_letter(&self, mut op: QueuedOperation, err: SyncError, report: &mut DrainReport) {
        op.status = OperationStatus::Failed;
        op.next_eligible_at = None;

        let moved = {
            let _guard = self.write_guard();
            put_json(self.store.as_ref(), &dead_key(&op.id), &op)
                .and_then(|_| self.store.delete(&pending_key(&op.id)))
        };
        if let Err(e) = moved {
            self.drop_record(&op.id, &e, report);
            return;
        }

        error!(
            operation_id = %op.id,
            kind = %op.kind,
            attempts = op.attempt_count,
            error = %err,
            "Operation moved to dead-letter log"
        );
        self.sink.report(
            ErrorReport::from_error(&err)
                .with("operation_id", &op.id)
                .with("kind", op.kind)
                .with("resource", &op.resource)
                .with("attempts", op.attempt_count),
        );
        report.dead_lettered += 1;
        let _ = self.events.send(QueueEvent::DeadLettered {
            id: op.id,
            kind: op.kind,
            attempts: op.attempt_count,
            category: err.category(),
            last_error: err.to_string(),
        });
    }

    fn drop_record(&self, id: &str, err: &StoreError, report: &mut DrainReport) {
        {
            let _guard = self.write_guard();
            if let Err(e) = self.store.delete(&pending_key(id)) {
                warn!(operation_id = %id, error = %e, "Failed to delete dropped operation");
            }
        }

        error!(operation_id = %id, error = %err, "Operation dropped after storage failure");
        self.sink.report(
            ErrorReport::new(ErrorCategory::Storage, err.to_string()).with("operation_id", id),
        );
        report.dropped += 1;
        let _ = self.events.send(QueueEvent::Dropped {
            id: id.to_string(),
            reason: err.to_string(),
        });
    }

    /// Pending records for selection; undecodable ones are dropped
    fn load_for_drain(&self, report: &mut DrainReport) -> Result<Vec<QueuedOperation>> {
        let mut ops = Vec::new();
        for (key, bytes) in self.store.list_prefix(PENDING_PREFIX)? {
            match serde_json::from_slice::<QueuedOperation>(&bytes) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    let id = key.trim_start_matches(PENDING_PREFIX).to_string();
                    self.drop_record(&id, &StoreError::codec(key.as_str(), e), report);
                }
            }
        }
        Ok(ops)
    }

    fn load(&self, prefix: &str) -> Result<Vec<QueuedOperation>> {
        Ok(self
            .store
            .list_prefix(prefix)?
            .into_iter()
            .filter_map(|(key, bytes)| match serde_json::from_slice(&bytes) {
                Ok(op) => Some(op),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable queue record");
                    None
                }
            })
            .collect())
    }

    fn persist_pending(&self, op: &QueuedOperation) -> std::result::Result<(), StoreError> {
        let _guard = self.write_guard();
        put_json(self.store.as_ref(), &pending_key(&op.id), op)
    }

    fn reset_in_flight(&self) -> Result<usize> {
        let mut reset = 0;
        for mut op in self.load(PENDING_PREFIX)? {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
                put_json(self.store.as_ref(), &pending_key(&op.id), &op)?;
                reset += 1;
            }
        }
        if reset > 0 {
            info!(count = reset, "Recovered in-flight operations");
        }
        Ok(reset)
    }

    fn refresh_depth(&self) {
        let pending = self
            .store
            .list_prefix(PENDING_PREFIX)
            .map(|e| e.len())
            .unwrap_or(0);
        let dead = self
            .store
            .list_prefix(DEAD_PREFIX)
            .map(|e| e.len())
            .unwrap_or(0);
        self.metrics.set_queue_depth(pending, dead);
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
