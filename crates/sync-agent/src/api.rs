//! Loopback HTTP API: health, metrics and the caller-facing sync surface

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use sync_core::{
    Cache, CacheNamespace, CacheStats, ComponentStatus, Credentials, DrainReport, DrainTrigger,
    HealthRegistry, OperationAction, OperationKind, QueueStats, QueuedOperation, RateAction,
    RateLimiter, RateRemaining, RateScope, SessionManager, SessionState, StructuredLogger,
    SyncError, SyncQueue,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub queue: Arc<SyncQueue>,
    pub cache: Arc<Cache>,
    pub limiter: Arc<RateLimiter>,
    pub session: Arc<SessionManager>,
    pub triggers: mpsc::Sender<DrainTrigger>,
    pub logger: StructuredLogger,
}

/// Error response carrying the sync error category
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::PermanentValidation(_) => StatusCode::BAD_REQUEST,
            SyncError::AuthExpired
            | SyncError::AuthRejected(_)
            | SyncError::SessionExpired
            | SyncError::NoSession => StatusCode::UNAUTHORIZED,
            SyncError::TransientNetwork(_) | SyncError::Timeout(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "error": self.0.to_string(),
            "category": self.0.category(),
        });
        if let SyncError::RateLimitExceeded { reset_in_ms, .. } = &self.0 {
            body["reset_in_ms"] = json!(reset_in_ms);
        }

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Offline work is still accepted
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueView {
    pub stats: QueueStats,
    pub draining: bool,
    pub paused: bool,
    pub pending: Vec<QueuedOperation>,
}

async fn list_queue(State(state): State<Arc<AppState>>) -> ApiResult<Json<QueueView>> {
    Ok(Json(QueueView {
        stats: state.queue.stats()?,
        draining: state.queue.is_draining(),
        paused: state.queue.gate().is_paused(),
        pending: state.queue.pending()?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub kind: OperationKind,
    pub resource: String,
    pub action: OperationAction,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn rate_action(kind: OperationKind) -> Option<RateAction> {
    match kind {
        OperationKind::Booking => Some(RateAction::Booking),
        OperationKind::CriticalAlert => Some(RateAction::CriticalAlert),
        _ => None,
    }
}

async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<impl IntoResponse> {
    if let Some(action) = rate_action(request.kind) {
        // Signed-out mutations are limited per device
        let user_id = state
            .session
            .current_session()
            .map(|s| s.user_id)
            .unwrap_or_else(|| state.session.device_id().to_string());
        state.limiter.check(&RateScope::new(user_id, action))?;
    }

    let id = state.queue.enqueue(
        request.kind,
        request.resource,
        request.action,
        request.payload,
    )?;

    if state.triggers.try_send(DrainTrigger::Manual).is_err() {
        debug!("Drain trigger channel full, relying on pending drain");
    }

    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

#[derive(Debug, Default, Deserialize)]
pub struct DrainRequest {
    /// Trigger recorded in the drain log, e.g. `network_reconnected`
    pub trigger: Option<String>,
}

async fn drain_queue(
    State(state): State<Arc<AppState>>,
    request: Option<Json<DrainRequest>>,
) -> ApiResult<Json<DrainReport>> {
    let trigger = request
        .and_then(|Json(r)| r.trigger)
        .unwrap_or_else(|| DrainTrigger::Manual.as_str().to_string());

    let report = state.queue.drain().await?;
    state.logger.log_drain(
        &trigger,
        report.delivered,
        report.deferred,
        report.dead_lettered,
    );
    Ok(Json(report))
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<QueuedOperation>>> {
    Ok(Json(state.queue.dead_letters()?))
}

async fn resubmit_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.queue.resubmit(&id)?;
    info!(operation_id = %id, "Dead letter resubmitted");
    let _ = state.triggers.try_send(DrainTrigger::Manual);
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

async fn purge_dead_letters(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let purged = state.queue.purge_dead_letters()?;
    info!(purged = purged, "Dead letters purged");
    Ok(Json(json!({ "purged": purged })))
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

async fn clear_cache(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let cleared = if namespace == "all" {
        state.cache.clear_all()?
    } else {
        let ns = CacheNamespace::parse(&namespace).ok_or_else(|| {
            SyncError::PermanentValidation(format!("unknown cache namespace: {}", namespace))
        })?;
        state.cache.clear(&ns)?
    };
    info!(namespace = %namespace, cleared = cleared, "Cache cleared");
    Ok(Json(json!({ "namespace": namespace, "cleared": cleared })))
}

/// Session as exposed over the API; tokens never leave the agent
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionView {
    pub state: SessionState,
    pub device_id: String,
    pub user_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refreshing: bool,
}

fn session_view(session: &SessionManager) -> SessionView {
    let current = session.current_session();
    SessionView {
        state: session.state(),
        device_id: session.device_id().to_string(),
        user_id: current.as_ref().map(|s| s.user_id.clone()),
        expires_at: current.as_ref().map(|s| s.expires_at),
        refreshing: session.is_refreshing(),
    }
}

async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionView> {
    Json(session_view(&state.session))
}

async fn sign_in(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<Credentials>,
) -> ApiResult<Json<SessionView>> {
    state.session.sign_in(&credentials).await?;
    let _ = state.triggers.try_send(DrainTrigger::Manual);
    Ok(Json(session_view(&state.session)))
}

async fn sign_out(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    state.session.sign_out().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitView {
    pub scope: String,
    /// No limit applies to this action
    pub unlimited: bool,
    pub remaining: Option<RateRemaining>,
}

async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
    Path((user, action)): Path<(String, String)>,
) -> Json<RateLimitView> {
    let scope = RateScope::new(user, RateAction::parse(&action));
    let remaining = state.limiter.remaining(&scope);
    Json(RateLimitView {
        scope: scope.to_string(),
        unlimited: scope.action.preset().is_none(),
        remaining,
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/queue", get(list_queue).post(enqueue))
        .route("/v1/queue/drain", post(drain_queue))
        .route(
            "/v1/dead-letters",
            get(list_dead_letters).delete(purge_dead_letters),
        )
        .route("/v1/dead-letters/:id/resubmit", post(resubmit_dead_letter))
        .route("/v1/cache", get(cache_stats))
        .route("/v1/cache/:namespace", delete(clear_cache))
        .route(
            "/v1/session",
            get(get_session).post(sign_in).delete(sign_out),
        )
        .route("/v1/rate-limits/:user/:action", get(rate_limit_status))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    bind_address: String,
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("{}:{}", bind_address, port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
