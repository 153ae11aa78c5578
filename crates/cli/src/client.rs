//! API client for the sync agent's loopback HTTP surface

use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// Non-success answer from the agent
#[derive(Debug, thiserror::Error)]
#[error("Agent returned {status}: {message}")]
pub struct AgentError {
    pub status: StatusCode,
    pub message: String,
    pub category: Option<String>,
    pub reset_in_ms: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    category: Option<String>,
    reset_in_ms: Option<u64>,
}

/// API client for the sync agent
pub struct AgentClient {
    client: Client,
    base_url: Url,
}

impl AgentClient {
    /// Create a new agent client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid agent URL")?;

        Ok(Self { client, base_url })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base_url.join(path).context("Invalid path")?;
        Ok(self.client.request(method, url))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .context("Failed to reach the sync agent")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed = serde_json::from_str::<ErrorBody>(&body).ok();
            return Err(AgentError {
                status,
                message: parsed.as_ref().map(|b| b.error.clone()).unwrap_or(body),
                category: parsed.as_ref().and_then(|b| b.category.clone()),
                reset_in_ms: parsed.and_then(|b| b.reset_in_ms),
            }
            .into());
        }

        if status == StatusCode::NO_CONTENT {
            return serde_json::from_value(serde_json::Value::Null)
                .context("Expected a response body");
        }
        response.json().await.context("Failed to parse response")
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path)?).await
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::POST, path)?.json(body)).await
    }

    /// Make a DELETE request
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::DELETE, path)?).await
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub kind: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: u8,
    pub attempt_count: u32,
    pub created_at: String,
    pub last_attempt_at: Option<String>,
    pub next_eligible_at: Option<String>,
    pub status: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub deferred: usize,
    pub dead_letters: usize,
    pub oldest_pending_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueView {
    pub stats: QueueStats,
    pub draining: bool,
    pub paused: bool,
    pub pending: Vec<Operation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainRequest {
    pub trigger: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    pub dropped: usize,
    pub paused: bool,
    /// Milliseconds until the next deferred record is eligible
    pub next_eligible_in: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accepted {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purged {
    pub purged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheCleared {
    pub namespace: String,
    pub cleared: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale: u64,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub state: String,
    pub device_id: String,
    pub user_id: Option<String>,
    pub expires_at: Option<String>,
    pub refreshing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRemaining {
    pub count: u32,
    pub reset_in_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitView {
    pub scope: String,
    pub unlimited: bool,
    pub remaining: Option<RateRemaining>,
}
