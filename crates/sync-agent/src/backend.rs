//! REST backend adapters
//!
//! [`HttpExecutor`] delivers queued operations and [`HttpAuthProvider`]
//! talks to the auth endpoints. Both classify HTTP outcomes into
//! [`SyncError`] so the queue and the session manager can decide whether to
//! retry, refresh or give up.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    AuthProvider, Credentials, DeviceInfo, Executor, OperationAction, QueuedOperation, Result,
    SessionManager, SyncError, TokenGrant,
};
use tracing::debug;
use url::Url;

/// Shared HTTP client for one backend base URL
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: Url,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        // Url::join drops the last segment unless the base ends with '/'
        let mut base_url = Url::parse(base_url).context("Invalid backend URL")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SyncError::PermanentValidation(format!("invalid path {}: {}", path, e)))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        Ok(self.client.request(method, self.endpoint(path)?))
    }
}

/// Send a request and classify the outcome
async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, body))
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    send(request)
        .await?
        .json()
        .await
        .map_err(|e| SyncError::PermanentValidation(format!("malformed response: {}", e)))
}

fn transport_error(err: reqwest::Error) -> SyncError {
    SyncError::TransientNetwork(err.to_string())
}

/// Map a non-success status to the error taxonomy
pub fn classify_status(status: StatusCode, body: String) -> SyncError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    match status {
        StatusCode::UNAUTHORIZED => SyncError::AuthExpired,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SyncError::TransientNetwork(detail)
        }
        s if s.is_server_error() => SyncError::TransientNetwork(detail),
        _ => SyncError::PermanentValidation(detail),
    }
}

/// Delivers queued operations to `{base}/{resource}`
pub struct HttpExecutor {
    backend: BackendClient,
    session: Arc<SessionManager>,
}

impl HttpExecutor {
    pub fn new(backend: BackendClient, session: Arc<SessionManager>) -> Self {
        Self { backend, session }
    }

    fn method(action: OperationAction) -> Method {
        match action {
            OperationAction::Insert => Method::POST,
            OperationAction::Update => Method::PATCH,
            OperationAction::Delete => Method::DELETE,
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, operation: &QueuedOperation) -> Result<()> {
        let token = match self.session.valid_access_token().await {
            Ok(token) => token,
            // The queue parks the record until a session is installed
            Err(SyncError::NoSession | SyncError::SessionExpired) => {
                return Err(SyncError::AuthExpired)
            }
            Err(e) => return Err(e),
        };

        let request = self
            .backend
            .request(Self::method(operation.action), &operation.resource)?
            .bearer_auth(token)
            .header("Idempotency-Key", operation.idempotency_key())
            .header("X-Device-Id", self.session.device_id())
            .json(&operation.payload);

        send(request).await?;
        debug!(
            operation_id = %operation.id,
            resource = %operation.resource,
            "Operation accepted by backend"
        );
        Ok(())
    }
}

/// Auth endpoints of the REST backend
pub struct HttpAuthProvider {
    backend: BackendClient,
}

impl HttpAuthProvider {
    pub fn new(backend: BackendClient) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn sign_in(&self, credentials: &Credentials, device_id: &str) -> Result<TokenGrant> {
        let request = self.backend.request(Method::POST, "auth/sign-in")?.json(&json!({
            "identifier": credentials.identifier,
            "secret": credentials.secret,
            "device_id": device_id,
        }));

        // A 401 here means wrong credentials, not an expired token
        match send_json(request).await {
            Err(SyncError::AuthExpired) => {
                Err(SyncError::AuthRejected("invalid credentials".into()))
            }
            other => other,
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let request = self
            .backend
            .request(Method::POST, "auth/refresh")?
            .json(&json!({ "refresh_token": refresh_token }));

        match send_json(request).await {
            Err(SyncError::AuthExpired) => {
                Err(SyncError::AuthRejected("refresh token rejected".into()))
            }
            other => other,
        }
    }

    async fn sign_out(&self, access_token: &str) -> Result<()> {
        let request = self
            .backend
            .request(Method::POST, "auth/sign-out")?
            .bearer_auth(access_token);
        send(request).await.map(|_| ())
    }

    async fn list_devices(&self, access_token: &str) -> Result<Vec<DeviceInfo>> {
        let request = self
            .backend
            .request(Method::GET, "auth/devices")?
            .bearer_auth(access_token);
        send_json(request).await
    }

    async fn revoke_device(&self, access_token: &str, device_id: &str) -> Result<()> {
        let request = self
            .backend
            .request(Method::DELETE, &format!("auth/devices/{}", device_id))?
            .bearer_auth(access_token);
        send(request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode as ServerStatus},
        routing::post,
        Json, Router,
    };
    use serde_json::Value;
    use std::sync::Mutex;
    use sync_core::{DrainGate, OperationKind, Session, SessionConfig, SystemClock};

    #[derive(Default)]
    struct Recorded {
        requests: Mutex<Vec<(String, Option<String>, Option<String>, Value)>>,
    }

    async fn record(
        State(recorded): State<Arc<Recorded>>,
        Path(resource): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> ServerStatus {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        recorded.requests.lock().unwrap().push((
            resource.clone(),
            header("authorization"),
            header("idempotency-key"),
            body,
        ));
        match resource.as_str() {
            "broken" => ServerStatus::SERVICE_UNAVAILABLE,
            "invalid" => ServerStatus::UNPROCESSABLE_ENTITY,
            _ => ServerStatus::CREATED,
        }
    }

    async fn spawn_backend() -> (String, Arc<Recorded>) {
        let recorded = Arc::new(Recorded::default());
        let app = Router::new()
            .route("/api/:resource", post(record))
            .with_state(recorded.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/api", addr), recorded)
    }

    fn executor(base_url: &str, signed_in: bool) -> HttpExecutor {
        let backend = BackendClient::new(base_url, Duration::from_secs(5)).unwrap();
        let session = Arc::new(SessionManager::new(
            Arc::new(HttpAuthProvider::new(backend.clone())),
            Arc::new(SystemClock),
            "device-1",
            DrainGate::new(),
            SessionConfig::default(),
        ));
        if signed_in {
            session.restore(Session {
                user_id: "user-1".into(),
                device_id: "device-1".into(),
                access_token: "token-abc".into(),
                refresh_token: "refresh-abc".into(),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            });
        }
        HttpExecutor::new(backend, session)
    }

    fn operation(resource: &str) -> QueuedOperation {
        QueuedOperation::new(
            OperationKind::Booking,
            resource,
            OperationAction::Insert,
            json!({ "slot": 3 }),
            chrono::Utc::now(),
            0,
        )
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            SyncError::AuthExpired
        );
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, String::new()).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "duplicate".into()),
            SyncError::PermanentValidation(detail) if detail.contains("duplicate")
        ));
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let backend = BackendClient::new("http://localhost:8000/api/v2", Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            backend.endpoint("/bookings").unwrap().as_str(),
            "http://localhost:8000/api/v2/bookings"
        );
        assert_eq!(
            backend.endpoint("auth/refresh").unwrap().as_str(),
            "http://localhost:8000/api/v2/auth/refresh"
        );
    }

    #[tokio::test]
    async fn test_executor_sends_token_and_idempotency_key() {
        let (base_url, recorded) = spawn_backend().await;
        let executor = executor(&base_url, true);
        let op = operation("bookings");

        executor.execute(&op).await.unwrap();

        let requests = recorded.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (resource, auth, key, body) = &requests[0];
        assert_eq!(resource, "bookings");
        assert_eq!(auth.as_deref(), Some("Bearer token-abc"));
        assert_eq!(key.as_deref(), Some(op.id.as_str()));
        assert_eq!(body, &json!({ "slot": 3 }));
    }

    #[tokio::test]
    async fn test_executor_classifies_backend_failures() {
        let (base_url, _) = spawn_backend().await;
        let executor = executor(&base_url, true);

        let err = executor.execute(&operation("broken")).await.unwrap_err();
        assert!(err.is_retryable());

        let err = executor.execute(&operation("invalid")).await.unwrap_err();
        assert!(matches!(err, SyncError::PermanentValidation(_)));
    }

    #[tokio::test]
    async fn test_executor_without_session_reports_auth_expired() {
        let (base_url, recorded) = spawn_backend().await;
        let executor = executor(&base_url, false);

        let err = tokio_test::assert_err!(executor.execute(&operation("bookings")).await);
        assert_eq!(err, SyncError::AuthExpired);
        assert!(recorded.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let executor = executor("http://127.0.0.1:9", true);
        let err = executor.execute(&operation("bookings")).await.unwrap_err();
        assert!(matches!(err, SyncError::TransientNetwork(_)));
    }
}
