//! Sync Agent - offline-resilient synchronization host
//!
//! Owns the single instance of every sync component: the durable queue and
//! its drain scheduler, the session manager and its refresh timer, the cache
//! and the rate limiter. Exposes them on a loopback HTTP API.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    health::components, Cache, CacheConfig, Clock, DrainGate, DrainScheduler, DurableStore,
    ErrorSink, FileStore, HealthRegistry, RateLimiter, SessionManager, StructuredLogger, SyncQueue,
    SystemClock,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod backend;
mod config;
mod tasks;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grace period for background tasks after shutdown is signalled
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting sync-agent");

    // Load configuration
    let config = config::AgentConfig::load()?;

    // Open the durable store first; nothing works without it
    let store: Arc<dyn DurableStore> = Arc::new(
        FileStore::open(&config.data_dir)
            .with_context(|| format!("Failed to open store at {}", config.data_dir.display()))?,
    );
    let device_id = tasks::resolve_device_id(store.as_ref(), config.device_id.clone())?;
    info!(device = %device_id, backend = %config.backend_url, "Agent configured");

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::STORE).await;
    health_registry.register(components::SYNC_QUEUE).await;
    health_registry.register(components::CACHE).await;
    health_registry.register(components::SESSION).await;

    // Initialize structured logger, also the error sink of every manager
    let logger = StructuredLogger::new(&device_id);
    let sink: Arc<dyn ErrorSink> = Arc::new(logger.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Drains stay paused until a session is installed
    let gate = DrainGate::new();
    gate.pause();

    let backend = backend::BackendClient::new(
        &config.backend_url,
        Duration::from_secs(config.request_timeout_secs),
    )?;

    let session = Arc::new(
        SessionManager::new(
            Arc::new(backend::HttpAuthProvider::new(backend.clone())),
            clock.clone(),
            device_id.clone(),
            gate.clone(),
            config.session_config(),
        )
        .with_error_sink(sink.clone()),
    );
    if !tasks::restore_session(store.as_ref(), &session) {
        health_registry
            .set_degraded(components::SESSION, "signed out")
            .await;
    }

    let executor = Arc::new(backend::HttpExecutor::new(backend, session.clone()));
    let queue = Arc::new(
        SyncQueue::new(store.clone(), executor, clock.clone(), config.queue_config())?
            .with_error_sink(sink)
            .with_gate(gate)
            .with_credential_refresher(session.clone()),
    );
    let recovered = queue.recover()?;
    if recovered > 0 {
        warn!(recovered = recovered, "Recovered operations interrupted by a previous run");
    }
    tasks::update_queue_health(&queue, &health_registry).await;

    let cache = Arc::new(Cache::new(store.clone(), clock.clone(), CacheConfig::default()));
    let limiter = Arc::new(RateLimiter::new(clock));

    logger.log_startup(AGENT_VERSION, queue.stats()?.pending);

    // Background workers
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (scheduler, triggers) = DrainScheduler::new(queue.clone(), logger.clone());
    let handles = vec![
        scheduler.spawn(shutdown_tx.subscribe()),
        session.clone().spawn_refresh_timer(shutdown_tx.subscribe()),
        tasks::spawn_session_watcher(
            session.clone(),
            store,
            health_registry.clone(),
            shutdown_tx.subscribe(),
        ),
        tasks::spawn_queue_watcher(
            queue.clone(),
            health_registry.clone(),
            shutdown_tx.subscribe(),
        ),
        tasks::spawn_maintenance(
            cache.clone(),
            limiter.clone(),
            queue.clone(),
            health_registry.clone(),
            config.maintenance_interval(),
            shutdown_tx.subscribe(),
        ),
    ];

    // Create shared application state
    let app_state = Arc::new(api::AppState {
        health_registry: health_registry.clone(),
        queue,
        cache,
        limiter,
        session,
        triggers,
        logger: logger.clone(),
    });

    // Mark agent as ready after initialization
    health_registry.set_ready(true).await;

    // Start the API server
    let api_handle = tokio::spawn(api::serve(
        config.bind_address.clone(),
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    for handle in handles {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Background task did not stop within the grace period");
        }
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, api_handle).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "API server exited with error"),
        Err(_) => warn!("API server did not stop within the grace period"),
        _ => {}
    }
    info!("Shutdown complete");

    Ok(())
}
