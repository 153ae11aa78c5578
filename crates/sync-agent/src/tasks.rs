//! Background tasks wiring manager events to persistence and health

use std::sync::Arc;
use std::time::Duration;
use sync_core::health::components;
use sync_core::store::{get_json, put_json};
use sync_core::{
    Cache, DurableStore, HealthRegistry, QueueEvent, RateLimiter, Session, SessionEvent,
    SessionManager, SyncQueue,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Store key of the persisted session
pub const SESSION_KEY: &str = "session/current";

/// Store key of the generated device identifier
const DEVICE_ID_KEY: &str = "device/id";

/// Configured device id, else the persisted one, else a new persisted id
pub fn resolve_device_id(
    store: &dyn DurableStore,
    configured: Option<String>,
) -> anyhow::Result<String> {
    if let Some(id) = configured {
        return Ok(id);
    }
    if let Some(id) = get_json::<String>(store, DEVICE_ID_KEY)? {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    put_json(store, DEVICE_ID_KEY, &id)?;
    info!(device = %id, "Generated device identifier");
    Ok(id)
}

/// Re-adopt the session saved by a previous run
///
/// An expired access token is still restored: the refresh timer renews it
/// immediately, or forces re-authentication if the refresh token is gone.
pub fn restore_session(store: &dyn DurableStore, session: &SessionManager) -> bool {
    match get_json::<Session>(store, SESSION_KEY) {
        Ok(Some(saved)) if saved.device_id == session.device_id() => {
            session.restore(saved);
            true
        }
        Ok(Some(_)) => {
            warn!("Persisted session belongs to another device, ignoring");
            false
        }
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "Failed to read persisted session");
            false
        }
    }
}

/// Persist session changes and mirror them into health
pub fn spawn_session_watcher(
    session: Arc<SessionManager>,
    store: Arc<dyn DurableStore>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(SessionEvent::SignedIn { .. } | SessionEvent::Refreshed { .. }) => {
                    if let Some(current) = session.current_session() {
                        if let Err(e) = put_json(store.as_ref(), SESSION_KEY, &current) {
                            warn!(error = %e, "Failed to persist session");
                        }
                    }
                    health.set_healthy(components::SESSION).await;
                }
                Ok(SessionEvent::ForcedReauthentication { reason }) => {
                    let _ = store.delete(SESSION_KEY);
                    health
                        .set_degraded(
                            components::SESSION,
                            format!("re-authentication required: {}", reason),
                        )
                        .await;
                }
                Ok(SessionEvent::SignedOut) => {
                    let _ = store.delete(SESSION_KEY);
                    health.set_degraded(components::SESSION, "signed out").await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped = skipped, "Session watcher lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Degrade queue health while dead letters are waiting
pub fn spawn_queue_watcher(
    queue: Arc<SyncQueue>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let mut events = queue.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(QueueEvent::DeadLettered { .. } | QueueEvent::Dropped { .. })
                | Err(RecvError::Lagged(_)) => update_queue_health(&queue, &health).await,
                Ok(QueueEvent::Delivered { .. }) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub async fn update_queue_health(queue: &SyncQueue, health: &HealthRegistry) {
    match queue.stats() {
        Ok(stats) if stats.dead_letters > 0 => {
            health
                .set_degraded(
                    components::SYNC_QUEUE,
                    format!("{} operations dead-lettered", stats.dead_letters),
                )
                .await
        }
        Ok(_) => health.set_healthy(components::SYNC_QUEUE).await,
        Err(e) => {
            health
                .set_unhealthy(components::STORE, e.to_string())
                .await
        }
    }
}

/// Periodically drop expired cache entries and idle rate-limit counters
pub fn spawn_maintenance(
    cache: Arc<Cache>,
    limiter: Arc<RateLimiter>,
    queue: Arc<SyncQueue>,
    health: HealthRegistry,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            match cache.purge_expired() {
                Ok(purged) => {
                    health.set_healthy(components::CACHE).await;
                    let idle = limiter.purge_idle();
                    debug!(purged_entries = purged, idle_scopes = idle, "Maintenance pass");
                }
                Err(e) => {
                    warn!(error = %e, "Cache maintenance failed");
                    health
                        .set_degraded(components::CACHE, e.to_string())
                        .await;
                }
            }
            update_queue_health(&queue, &health).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sync_core::{
        AuthProvider, Credentials, DeviceInfo, DrainGate, FileStore, MemoryStore, SessionConfig,
        SessionState, SyncError, SystemClock, TokenGrant,
    };

    struct OneShotAuth;

    #[async_trait]
    impl AuthProvider for OneShotAuth {
        async fn sign_in(
            &self,
            credentials: &Credentials,
            _device_id: &str,
        ) -> sync_core::Result<TokenGrant> {
            Ok(TokenGrant {
                user_id: credentials.identifier.clone(),
                access_token: "access".into(),
                refresh_token: "refresh".into(),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> sync_core::Result<TokenGrant> {
            Err(SyncError::AuthRejected("expired".into()))
        }

        async fn sign_out(&self, _access_token: &str) -> sync_core::Result<()> {
            Ok(())
        }

        async fn list_devices(&self, _access_token: &str) -> sync_core::Result<Vec<DeviceInfo>> {
            Ok(Vec::new())
        }

        async fn revoke_device(
            &self,
            _access_token: &str,
            _device_id: &str,
        ) -> sync_core::Result<()> {
            Ok(())
        }
    }

    fn manager(device_id: &str) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(OneShotAuth),
            Arc::new(SystemClock),
            device_id,
            DrainGate::new(),
            SessionConfig::default(),
        ))
    }

    #[test]
    fn test_device_id_is_generated_once() {
        let store = MemoryStore::new();
        let first = resolve_device_id(&store, None).unwrap();
        let second = resolve_device_id(&store, None).unwrap();
        assert_eq!(first, second);

        let configured = resolve_device_id(&store, Some("tablet".into())).unwrap();
        assert_eq!(configured, "tablet");
    }

    #[test]
    fn test_device_id_survives_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let store = FileStore::open(dir.path()).unwrap();
            resolve_device_id(&store, None).unwrap()
        };
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(resolve_device_id(&store, None).unwrap(), first);
    }

    #[tokio::test]
    async fn test_session_survives_restart() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let health = HealthRegistry::new();
        let (shutdown_tx, _) = broadcast::channel(1);

        let session = manager("device-1");
        let watcher = spawn_session_watcher(
            session.clone(),
            store.clone(),
            health.clone(),
            shutdown_tx.subscribe(),
        );
        session
            .sign_in(&Credentials {
                identifier: "alice".into(),
                secret: "pw".into(),
            })
            .await
            .unwrap();

        // Let the watcher persist the session
        for _ in 0..50 {
            if store.get(SESSION_KEY).unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = shutdown_tx.send(());
        watcher.await.unwrap();

        let restarted = manager("device-1");
        assert!(restore_session(store.as_ref(), &restarted));
        assert_eq!(restarted.state(), SessionState::Active);
        assert_eq!(restarted.current_session().unwrap().user_id, "alice");

        let other_device = manager("device-2");
        assert!(!restore_session(store.as_ref(), &other_device));
    }

    #[tokio::test]
    async fn test_sign_out_removes_persisted_session() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let health = HealthRegistry::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let session = manager("device-1");
        session
            .sign_in(&Credentials {
                identifier: "alice".into(),
                secret: "pw".into(),
            })
            .await
            .unwrap();
        put_json(store.as_ref(), SESSION_KEY, &session.current_session().unwrap()).unwrap();

        let watcher = spawn_session_watcher(
            session.clone(),
            store.clone(),
            health.clone(),
            shutdown_tx.subscribe(),
        );
        session.sign_out().await.unwrap();

        let signed_out = || async {
            health
                .health()
                .await
                .components
                .get(components::SESSION)
                .and_then(|c| c.message.clone())
        };
        for _ in 0..50 {
            if signed_out().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(signed_out().await.as_deref(), Some("signed out"));
        assert!(store.get(SESSION_KEY).unwrap().is_none());

        let _ = shutdown_tx.send(());
        watcher.await.unwrap();
    }
}
