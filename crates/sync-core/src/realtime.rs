//! Realtime subscription management
//!
//! Each channel key maps to at most one live subscription. A subscription
//! owns a background task that opens the channel through the pub/sub
//! provider, dispatches change events to its handlers in arrival order, and
//! reconnects with backoff when the stream drops. After
//! `max_reconnect_attempts` consecutive failures the channel is closed and a
//! persistent-disconnect event is published.

use crate::error::{Result, SyncError};
use crate::observability::{StructuredLogger, SyncMetrics};
use crate::retry::RetryConfig;
use crate::sink::{ErrorReport, ErrorSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Identity of a realtime channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Which server-side changes a channel receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilter {
    pub resource: String,
    /// Provider-specific row filter, e.g. `ride_id=eq.42`
    pub filter: Option<String>,
}

impl ResourceFilter {
    pub fn resource(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A server-side change pushed to a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub resource: String,
    pub record: serde_json::Value,
    pub old_record: Option<serde_json::Value>,
    pub commit_timestamp: DateTime<Utc>,
}

/// Message received on an open channel
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Change(ChangeEvent),
    Disconnected { reason: String },
}

/// Stream of messages for one open channel; ends when the connection drops
pub type ChannelStream = mpsc::Receiver<PushMessage>;

/// Server push transport
#[async_trait]
pub trait PubSubProvider: Send + Sync {
    async fn open_channel(&self, key: &ChannelKey, filter: &ResourceFilter)
        -> Result<ChannelStream>;

    async fn close_channel(&self, key: &ChannelKey) -> Result<()>;
}

type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Callbacks for one subscription, invoked on the channel's task
#[derive(Clone, Default)]
pub struct SubscriptionHandlers {
    on_insert: Option<Handler>,
    on_update: Option<Handler>,
    on_delete: Option<Handler>,
}

impl SubscriptionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert(mut self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Arc::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Arc::new(f));
        self
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let handler = match event.kind {
            ChangeKind::Insert => &self.on_insert,
            ChangeKind::Update => &self.on_update,
            ChangeKind::Delete => &self.on_delete,
        };
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Connection lifecycle events across all channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectivityEvent {
    Connected { channel: ChannelKey },
    Reconnecting { channel: ChannelKey, attempt: u32 },
    PersistentDisconnect { channel: ChannelKey, attempts: u32 },
}

/// Realtime manager configuration
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Consecutive failed connection attempts before a channel is closed
    pub max_reconnect_attempts: u32,
    /// Backoff between reconnection attempts; `timeout` bounds each open
    pub backoff: RetryConfig,
    pub event_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            backoff: RetryConfig {
                max_retries: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                timeout: Duration::from_secs(10),
            },
            event_capacity: 64,
        }
    }
}

/// Caller's view of a subscription
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    key: ChannelKey,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Whether both handles refer to the same underlying channel
    pub fn same_subscription(&self, other: &SubscriptionHandle) -> bool {
        self.id == other.id
    }

    /// Wait until the subscription reaches `state`
    pub async fn wait_for(&mut self, state: SubscriptionState) {
        let _ = self.state.wait_for(|s| *s == state).await;
    }
}

struct ChannelEntry {
    handle: SubscriptionHandle,
    state: Arc<watch::Sender<SubscriptionState>>,
    task: JoinHandle<()>,
}

struct Shared {
    provider: Arc<dyn PubSubProvider>,
    config: RealtimeConfig,
    channels: Mutex<HashMap<ChannelKey, ChannelEntry>>,
    events: broadcast::Sender<ConnectivityEvent>,
    sink: Arc<dyn ErrorSink>,
    metrics: SyncMetrics,
}

impl Shared {
    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelKey, ChannelEntry>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ConnectivityEvent) {
        let _ = self.events.send(event);
    }

    fn update_gauge(&self) {
        let active = self.channels().len();
        self.metrics.set_active_channels(active);
    }
}

/// Realtime subscription manager
pub struct RealtimeManager {
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl RealtimeManager {
    pub fn new(provider: Arc<dyn PubSubProvider>, config: RealtimeConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                provider,
                config,
                channels: Mutex::new(HashMap::new()),
                events,
                sink: Arc::new(StructuredLogger::new("local")),
                metrics: SyncMetrics::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Set the error sink; call before the first subscription
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.sink = sink;
        }
        self
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.shared.events.subscribe()
    }

    /// Subscribe to `key`, or return the live subscription already using it
    pub fn subscribe(
        &self,
        key: impl Into<ChannelKey>,
        filter: ResourceFilter,
        handlers: SubscriptionHandlers,
    ) -> SubscriptionHandle {
        let key = key.into();
        let mut channels = self.shared.channels();
        if let Some(existing) = channels.get(&key) {
            debug!(channel = %key, "Reusing existing subscription");
            return existing.handle.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Connecting);
        let state_tx = Arc::new(state_tx);
        let handle = SubscriptionHandle {
            id,
            key: key.clone(),
            state: state_rx,
        };

        let task = tokio::spawn(run_channel(
            Arc::clone(&self.shared),
            id,
            key.clone(),
            filter,
            handlers,
            Arc::clone(&state_tx),
        ));

        info!(channel = %key, "Subscribing to realtime channel");
        channels.insert(
            key,
            ChannelEntry {
                handle: handle.clone(),
                state: state_tx,
                task,
            },
        );
        drop(channels);
        self.shared.update_gauge();
        handle
    }

    /// Close the subscription for `key`; unknown keys are ignored
    pub async fn unsubscribe(&self, key: &ChannelKey) -> Result<()> {
        let Some(entry) = self.shared.channels().remove(key) else {
            return Ok(());
        };
        entry.task.abort();
        entry.state.send_replace(SubscriptionState::Closed);
        self.shared.update_gauge();

        info!(channel = %key, "Unsubscribed from realtime channel");
        if let Err(e) = self.shared.provider.close_channel(key).await {
            warn!(channel = %key, error = %e, "Provider failed to close channel");
        }
        Ok(())
    }

    pub async fn unsubscribe_all(&self) -> Result<()> {
        for key in self.active_channels() {
            self.unsubscribe(&key).await?;
        }
        Ok(())
    }

    pub fn state(&self, key: &ChannelKey) -> Option<SubscriptionState> {
        self.shared.channels().get(key).map(|e| e.handle.state())
    }

    /// Keys of live subscriptions, sorted
    pub fn active_channels(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<_> = self.shared.channels().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Stops every channel task; provider channels are left to
/// [`RealtimeManager::unsubscribe_all`]
impl Drop for RealtimeManager {
    fn drop(&mut self) {
        let channels: Vec<_> = self.shared.channels().drain().collect();
        for (key, entry) in channels {
            entry.task.abort();
            entry.state.send_replace(SubscriptionState::Closed);
            debug!(channel = %key, "Realtime channel stopped");
        }
        self.shared.update_gauge();
    }
}

async fn run_channel(
    shared: Arc<Shared>,
    id: u64,
    key: ChannelKey,
    filter: ResourceFilter,
    handlers: SubscriptionHandlers,
    state: Arc<watch::Sender<SubscriptionState>>,
) {
    let backoff = &shared.config.backoff;
    let max_attempts = shared.config.max_reconnect_attempts;
    let mut failures = 0u32;

    loop {
        let opened = tokio::time::timeout(
            backoff.timeout,
            shared.provider.open_channel(&key, &filter),
        )
        .await
        .unwrap_or(Err(SyncError::Timeout(backoff.timeout)));

        match opened {
            Ok(mut stream) => {
                failures = 0;
                state.send_replace(SubscriptionState::Connected);
                info!(channel = %key, resource = %filter.resource, "Realtime channel connected");
                shared.publish(ConnectivityEvent::Connected {
                    channel: key.clone(),
                });

                let reason = loop {
                    match stream.recv().await {
                        Some(PushMessage::Change(event)) => handlers.dispatch(&event),
                        Some(PushMessage::Disconnected { reason }) => break reason,
                        None => break "stream closed".to_string(),
                    }
                };
                warn!(channel = %key, reason = %reason, "Realtime channel dropped");
            }
            Err(e) => {
                failures += 1;
                warn!(
                    channel = %key,
                    error = %e,
                    failures = failures,
                    max_attempts = max_attempts,
                    "Failed to open realtime channel"
                );
                if failures >= max_attempts {
                    close_exhausted(&shared, id, &key, &state, failures);
                    return;
                }
            }
        }

        let attempt = failures + 1;
        state.send_replace(SubscriptionState::Reconnecting);
        shared.metrics.inc_realtime_reconnect();
        shared.publish(ConnectivityEvent::Reconnecting {
            channel: key.clone(),
            attempt,
        });
        tokio::time::sleep(backoff.backoff_delay(attempt)).await;
    }
}

fn close_exhausted(
    shared: &Shared,
    id: u64,
    key: &ChannelKey,
    state: &watch::Sender<SubscriptionState>,
    attempts: u32,
) {
    state.send_replace(SubscriptionState::Closed);
    {
        let mut channels = shared.channels();
        if channels.get(key).map(|e| e.handle.id) == Some(id) {
            channels.remove(key);
        }
    }
    shared.update_gauge();

    let err = SyncError::ReconnectExhausted {
        channel: key.to_string(),
        attempts,
    };
    error!(channel = %key, attempts = attempts, "Realtime channel closed after reconnect attempts");
    shared
        .sink
        .report(ErrorReport::from_error(&err).with("channel", key));
    shared.publish(ConnectivityEvent::PersistentDisconnect {
        channel: key.clone(),
        attempts,
    });
}
