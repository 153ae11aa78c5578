//! Background drain scheduling
//!
//! The scheduler drains once at startup to flush anything queued before a
//! crash, then again on every periodic tick, explicit trigger, gate resume,
//! or when the earliest backed-off record becomes eligible.

use super::SyncQueue;
use crate::observability::StructuredLogger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Capacity of the trigger channel; extra triggers coalesce
const TRIGGER_CAPACITY: usize = 16;

/// Reason a drain was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    Startup,
    Periodic,
    NetworkReconnected,
    AppForeground,
    Manual,
    /// Drains were resumed after a pause
    Resumed,
    /// A deferred record became eligible
    Backoff,
}

impl DrainTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainTrigger::Startup => "startup",
            DrainTrigger::Periodic => "periodic",
            DrainTrigger::NetworkReconnected => "network_reconnected",
            DrainTrigger::AppForeground => "app_foreground",
            DrainTrigger::Manual => "manual",
            DrainTrigger::Resumed => "resumed",
            DrainTrigger::Backoff => "backoff",
        }
    }
}

/// Background worker that drives queue drains
pub struct DrainScheduler {
    queue: Arc<SyncQueue>,
    triggers: mpsc::Receiver<DrainTrigger>,
    interval: Duration,
    logger: StructuredLogger,
}

impl DrainScheduler {
    /// Create a scheduler and the sender used to trigger drains
    pub fn new(
        queue: Arc<SyncQueue>,
        logger: StructuredLogger,
    ) -> (Self, mpsc::Sender<DrainTrigger>) {
        let (tx, rx) = mpsc::channel(TRIGGER_CAPACITY);
        let interval = queue.config().drain_interval;
        (
            Self {
                queue,
                triggers: rx,
                interval,
                logger,
            },
            tx,
        )
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until shutdown
    ///
    /// A drain in progress at shutdown is abandoned; records it had not yet
    /// confirmed stay in the store.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting drain scheduler"
        );

        let mut gate = self.queue.gate().subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the startup drain covers it.
        ticker.tick().await;

        let mut trigger = Some(DrainTrigger::Startup);
        let mut next_wake = None;
        loop {
            if let Some(t) = trigger.take() {
                next_wake = tokio::select! {
                    wake = self.drain(t) => wake,
                    _ = shutdown.recv() => break,
                };
            }

            let backoff = async move {
                match next_wake {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending().await,
                }
            };

            trigger = tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => Some(DrainTrigger::Periodic),
                Some(t) = self.triggers.recv() => Some(t),
                _ = backoff => Some(DrainTrigger::Backoff),
                Ok(()) = gate.changed() => {
                    let paused = *gate.borrow_and_update();
                    (!paused).then_some(DrainTrigger::Resumed)
                }
            };
        }

        info!("Drain scheduler shutting down");
    }

    /// Run one drain and return when the scheduler should wake for backoff
    async fn drain(&self, trigger: DrainTrigger) -> Option<Duration> {
        debug!(trigger = trigger.as_str(), "Draining sync queue");
        match self.queue.drain().await {
            Ok(report) if report.paused => {
                debug!(trigger = trigger.as_str(), "Drain skipped, queue paused");
                None
            }
            Ok(report) => {
                if report.delivered + report.failed + report.dead_lettered + report.dropped > 0 {
                    self.logger.log_drain(
                        trigger.as_str(),
                        report.delivered,
                        report.deferred,
                        report.dead_lettered,
                    );
                }
                report.next_eligible_in
            }
            Err(e) => {
                warn!(trigger = trigger.as_str(), error = %e, "Drain failed");
                None
            }
        }
    }
}
