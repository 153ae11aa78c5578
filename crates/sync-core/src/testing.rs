//! In-memory collaborators for tests

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::queue::{Executor, QueuedOperation};
use crate::realtime::{ChannelKey, ChannelStream, PubSubProvider, PushMessage, ResourceFilter};
use crate::session::{AuthProvider, Credentials, DeviceInfo, TokenGrant};
use crate::sink::{ErrorReport, ErrorSink};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Error sink that keeps every report
#[derive(Default)]
pub struct MemoryErrorSink {
    reports: Mutex<Vec<ErrorReport>>,
}

impl MemoryErrorSink {
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for MemoryErrorSink {
    fn report(&self, report: ErrorReport) {
        self.reports.lock().unwrap().push(report);
    }
}

/// Executor whose failures are scripted per resource
#[derive(Default)]
pub struct ScriptedExecutor {
    scripted: Mutex<HashMap<String, VecDeque<SyncError>>>,
    permanent: Mutex<HashMap<String, SyncError>>,
    delay: Mutex<Duration>,
    delivered: Mutex<Vec<QueuedOperation>>,
    attempts: AtomicU32,
}

impl ScriptedExecutor {
    /// Fail the next calls for `resource` with `errors`, in order
    pub fn fail_next(&self, resource: &str, errors: Vec<SyncError>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .extend(errors);
    }

    /// Fail every call for `resource`
    pub fn fail_always(&self, resource: &str, error: SyncError) {
        self.permanent
            .lock()
            .unwrap()
            .insert(resource.to_string(), error);
    }

    pub fn heal(&self, resource: &str) {
        self.permanent.lock().unwrap().remove(resource);
        self.scripted.lock().unwrap().remove(resource);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn delivered(&self) -> Vec<QueuedOperation> {
        self.delivered.lock().unwrap().clone()
    }

    /// Resources of delivered operations, in delivery order
    pub fn delivered_resources(&self) -> Vec<String> {
        self.delivered()
            .into_iter()
            .map(|op| op.resource)
            .collect()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, operation: &QueuedOperation) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.permanent.lock().unwrap().get(&operation.resource) {
            return Err(error.clone());
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&operation.resource)
            .and_then(|errors| errors.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        self.delivered.lock().unwrap().push(operation.clone());
        Ok(())
    }
}

/// Auth provider issuing hour-long tokens from a test clock
pub struct FakeAuthProvider {
    clock: Arc<dyn Clock>,
    pub refresh_calls: AtomicU32,
    issued: AtomicU32,
    refresh_delay: Mutex<Duration>,
    refresh_failure: Mutex<Option<SyncError>>,
    devices: Mutex<Vec<String>>,
}

impl FakeAuthProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            refresh_calls: AtomicU32::new(0),
            issued: AtomicU32::new(0),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_failure: Mutex::new(None),
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn fail_refresh_with(&self, error: SyncError) {
        *self.refresh_failure.lock().unwrap() = Some(error);
    }

    pub fn clear_refresh_failure(&self) {
        *self.refresh_failure.lock().unwrap() = None;
    }

    fn grant(&self) -> TokenGrant {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        TokenGrant {
            user_id: "user-1".into(),
            access_token: format!("access-{}", n),
            refresh_token: format!("refresh-{}", n),
            expires_at: self.clock.now() + chrono::Duration::hours(1),
        }
    }
}

#[async_trait]
impl AuthProvider for FakeAuthProvider {
    async fn sign_in(&self, _credentials: &Credentials, device_id: &str) -> Result<TokenGrant> {
        let mut devices = self.devices.lock().unwrap();
        if !devices.iter().any(|d| d == device_id) {
            devices.push(device_id.to_string());
        }
        drop(devices);
        Ok(self.grant())
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.refresh_failure.lock().unwrap().clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(self.grant()),
        }
    }

    async fn sign_out(&self, _access_token: &str) -> Result<()> {
        Ok(())
    }

    async fn list_devices(&self, _access_token: &str) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|id| DeviceInfo {
                device_id: id.clone(),
                name: None,
                last_seen_at: None,
            })
            .collect())
    }

    async fn revoke_device(&self, _access_token: &str, device_id: &str) -> Result<()> {
        self.devices.lock().unwrap().retain(|d| d != device_id);
        Ok(())
    }
}

/// Pub/sub provider backed by in-process channels
#[derive(Default)]
pub struct FakePubSub {
    opens: AtomicU32,
    closes: AtomicU32,
    failing: AtomicBool,
    senders: Mutex<HashMap<ChannelKey, mpsc::Sender<PushMessage>>>,
}

impl FakePubSub {
    pub fn open_calls(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_opens(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn push(&self, key: &ChannelKey, message: PushMessage) {
        let sender = self.senders.lock().unwrap().get(key).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(message).await;
        }
    }

    pub async fn disconnect(&self, key: &ChannelKey) {
        self.push(
            key,
            PushMessage::Disconnected {
                reason: "connection lost".into(),
            },
        )
        .await;
    }
}

#[async_trait]
impl PubSubProvider for FakePubSub {
    async fn open_channel(
        &self,
        key: &ChannelKey,
        _filter: &ResourceFilter,
    ) -> Result<ChannelStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::TransientNetwork("pub/sub unreachable".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().unwrap().insert(key.clone(), tx);
        Ok(rx)
    }

    async fn close_channel(&self, key: &ChannelKey) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.senders.lock().unwrap().remove(key);
        Ok(())
    }
}
