//! Single-flight execution
//!
//! At most one execution of a guarded operation runs at a time. Callers that
//! arrive while it is running join it and receive a clone of its result
//! instead of starting their own.
//!
//! [`SingleFlight::run`] executes on the leader's task, so dropping the leader
//! abandons the work. [`SingleFlight::run_detached`] spawns it instead; the
//! work then completes even if every caller goes away.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// The leader of a joined flight was dropped before producing a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("In-flight operation was abandoned before completing")]
pub struct FlightAbandoned;

type Slot<T> = Mutex<Option<watch::Receiver<Option<T>>>>;

/// Single-flight guard for one class of operation
pub struct SingleFlight<T> {
    slot: Arc<Slot<T>>,
}

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Follower(watch::Receiver<Option<T>>),
}

/// Frees the slot when the leader finishes or is cancelled
struct SlotGuard<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T: Clone + Send + Sync> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an execution is currently running
    pub fn is_in_flight(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `op`, or join the execution already in flight
    ///
    /// `op` is only invoked when this caller becomes the leader.
    pub async fn run<F, Fut>(&self, op: F) -> Result<T, FlightAbandoned>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let role = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let guard = SlotGuard {
                    slot: Arc::clone(&self.slot),
                };
                let outcome = op().await;
                // Free the slot before publishing so later callers start a new flight.
                drop(guard);
                let _ = tx.send(Some(outcome.clone()));
                Ok(outcome)
            }
            Role::Follower(rx) => wait_for_outcome(rx).await,
        }
    }

    /// Like [`run`](Self::run), but the leader's work runs on its own task
    ///
    /// `work` is dropped unpolled when a flight is already running. Cancelling
    /// any caller, the first one included, leaves the flight running.
    pub async fn run_detached<Fut>(&self, work: Fut) -> Result<T, FlightAbandoned>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let rx = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    let guard = SlotGuard {
                        slot: Arc::clone(&self.slot),
                    };
                    tokio::spawn(async move {
                        let outcome = work.await;
                        drop(guard);
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };
        wait_for_outcome(rx).await
    }
}

async fn wait_for_outcome<T: Clone>(
    mut rx: watch::Receiver<Option<T>>,
) -> Result<T, FlightAbandoned> {
    let value = rx
        .wait_for(|v| v.is_some())
        .await
        .map_err(|_| FlightAbandoned)?;
    value.as_ref().cloned().ok_or(FlightAbandoned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let run = |flight: Arc<SingleFlight<u32>>, calls: Arc<AtomicU32>| async move {
            flight
                .run(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    42
                })
                .await
        };

        let (a, b) = tokio::join!(
            run(Arc::clone(&flight), Arc::clone(&calls)),
            run(Arc::clone(&flight), Arc::clone(&calls))
        );

        assert_eq!(a, Ok(42));
        assert_eq!(b, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flight.is_in_flight());
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let flight = SingleFlight::<u32>::new();
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            flight
                .run(|| async { calls.fetch_add(1, Ordering::SeqCst) })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_releases_followers() {
        let flight = Arc::new(SingleFlight::<u32>::new());

        let leader_flight = Arc::clone(&flight);
        let leader = tokio::spawn(async move {
            leader_flight
                .run(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    1
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(flight.is_in_flight());

        let follower_flight = Arc::clone(&flight);
        let follower =
            tokio::spawn(async move { follower_flight.run(|| async { 2 }).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        leader.abort();
        assert_eq!(follower.await.unwrap(), Err(FlightAbandoned));
        assert!(!flight.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_flight_outlives_cancelled_callers() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let finished = Arc::new(AtomicU32::new(0));

        let done = Arc::clone(&finished);
        let first = flight.run_detached(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            done.fetch_add(1, Ordering::SeqCst);
            7
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), first).await;
        assert!(timed_out.is_err());
        assert!(flight.is_in_flight());

        // A later caller joins the surviving flight rather than starting its own.
        let joined = flight.run_detached(async { 0 }).await;
        assert_eq!(joined, Ok(7));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!flight.is_in_flight());
    }
}
