//! Authentication session management
//!
//! This module provides:
//! - The current session and its state (signed out, active, expired)
//! - Single-flight token refresh ahead of expiry, through the retry engine
//! - A background timer that refreshes `refresh_lead` before `expires_at`
//! - Forced re-authentication on terminal refresh failure, which also pauses
//!   sync queue drains until the next sign-in
//! - Device enumeration and revocation, delegated to the auth provider

use crate::clock::{chrono_duration, millis_until, Clock};
use crate::error::{Result, SyncError};
use crate::flight::SingleFlight;
use crate::observability::{StructuredLogger, SyncMetrics};
use crate::queue::DrainGate;
use crate::retry::{retry_sync_call, RetryConfig};
use crate::sink::{ErrorReport, ErrorSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sign-in credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub identifier: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Tokens issued by the auth provider
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// A device signed in to the user's account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub name: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// The authenticated identity of this device
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    fn from_grant(grant: TokenGrant, device_id: &str) -> Self {
        Self {
            user_id: grant.user_id,
            device_id: device_id.to_string(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_at,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    SignedOut,
    Active,
    /// Refresh failed terminally; the user must sign in again
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SignedIn { user_id: String },
    Refreshed { expires_at: DateTime<Utc> },
    ForcedReauthentication { reason: String },
    SignedOut,
}

/// Token issuance, refresh and device management
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in(&self, credentials: &Credentials, device_id: &str) -> Result<TokenGrant>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    async fn sign_out(&self, access_token: &str) -> Result<()>;

    async fn list_devices(&self, access_token: &str) -> Result<Vec<DeviceInfo>>;

    async fn revoke_device(&self, access_token: &str, device_id: &str) -> Result<()>;
}

/// Refreshes credentials after the backend reports them expired
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh_credentials(&self) -> Result<()>;
}

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long before `expires_at` a refresh is due
    pub refresh_lead: Duration,
    pub retry: RetryConfig,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_lead: Duration::from_secs(5 * 60),
            retry: RetryConfig::api(),
            event_capacity: 64,
        }
    }
}

struct SessionSlot {
    session: Option<Session>,
    state: SessionState,
}

impl SessionSlot {
    /// Whether `session` is still the one installed
    fn holds(&self, session: &Session) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.refresh_token == session.refresh_token)
    }
}

/// State shared between the manager and its detached refreshes
#[derive(Clone)]
struct SessionCore {
    auth: Arc<dyn AuthProvider>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    device_id: String,
    slot: Arc<RwLock<SessionSlot>>,
    gate: DrainGate,
    sink: Arc<dyn ErrorSink>,
    events: broadcast::Sender<SessionEvent>,
    /// Wakes the refresh timer when the session changes
    changed: Arc<Notify>,
    metrics: SyncMetrics,
}

/// Holds the current session and keeps it fresh
///
/// Refreshes run on their own task. A caller that gives up waiting (a
/// timed-out request, a cancelled drain) does not cancel the refresh, so
/// rotated tokens issued by the provider are never lost.
pub struct SessionManager {
    core: SessionCore,
    flight: SingleFlight<Result<Session>>,
}

impl SessionManager {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        clock: Arc<dyn Clock>,
        device_id: impl Into<String>,
        gate: DrainGate,
        config: SessionConfig,
    ) -> Self {
        let device_id = device_id.into();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            core: SessionCore {
                auth,
                clock,
                config,
                sink: Arc::new(StructuredLogger::new(device_id.clone())),
                device_id,
                slot: Arc::new(RwLock::new(SessionSlot {
                    session: None,
                    state: SessionState::SignedOut,
                })),
                gate,
                events,
                changed: Arc::new(Notify::new()),
                metrics: SyncMetrics::new(),
            },
            flight: SingleFlight::new(),
        }
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.core.sink = sink;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.core.device_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.core
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .session
            .clone()
    }

    pub fn state(&self) -> SessionState {
        self.core
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn is_refreshing(&self) -> bool {
        self.flight.is_in_flight()
    }

    /// Sign in and start a new session
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
        let core = &self.core;
        let grant = retry_sync_call(
            || core.auth.sign_in(credentials, &core.device_id),
            &core.config.retry,
        )
        .await?;
        let session = Session::from_grant(grant, &core.device_id);

        info!(
            event = "signed_in",
            user = %session.user_id,
            device = %core.device_id,
            expires_at = %session.expires_at,
            "Session started"
        );
        core.install(session.clone());
        let _ = core.events.send(SessionEvent::SignedIn {
            user_id: session.user_id.clone(),
        });
        Ok(session)
    }

    /// Adopt a previously persisted session
    pub fn restore(&self, session: Session) {
        debug!(user = %session.user_id, "Session restored");
        self.core.install(session);
    }

    /// End the session locally and, best effort, on the backend
    ///
    /// Drains pause, since nothing can be delivered without credentials.
    pub async fn sign_out(&self) -> Result<()> {
        let Some(session) = self.core.take_session(SessionState::SignedOut) else {
            return Err(SyncError::NoSession);
        };
        if let Err(e) = self.core.auth.sign_out(&session.access_token).await {
            warn!(error = %e, "Backend sign-out failed, session cleared locally");
        }

        info!(event = "signed_out", user = %session.user_id, "Session ended");
        let _ = self.core.events.send(SessionEvent::SignedOut);
        Ok(())
    }

    /// Access token valid beyond the refresh lead, refreshing if needed
    ///
    /// Callers arriving during a refresh join it instead of starting another.
    pub async fn valid_access_token(&self) -> Result<String> {
        let session = self.core.require_session()?;
        if self.core.clock.now() < self.core.refresh_due_at(&session) {
            return Ok(session.access_token);
        }
        Ok(self.refresh_now().await?.access_token)
    }

    /// Refresh immediately, joining any refresh already in flight
    pub async fn refresh_now(&self) -> Result<Session> {
        let core = self.core.clone();
        self.flight
            .run_detached(async move { core.refresh_once().await })
            .await
            .map_err(|_| SyncError::Cancelled)?
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let token = self.valid_access_token().await?;
        let core = &self.core;
        retry_sync_call(|| core.auth.list_devices(&token), &core.config.retry).await
    }

    pub async fn revoke_device(&self, device_id: &str) -> Result<()> {
        let token = self.valid_access_token().await?;
        let core = &self.core;
        retry_sync_call(
            || core.auth.revoke_device(&token, device_id),
            &core.config.retry,
        )
        .await?;
        info!(revoked_device = %device_id, "Device revoked");
        Ok(())
    }

    /// Refresh `refresh_lead` before every expiry until shutdown
    pub fn spawn_refresh_timer(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let due_in = self.current_session().map(|s| {
                    Duration::from_millis(millis_until(
                        self.core.clock.now(),
                        self.core.refresh_due_at(&s),
                    ))
                });

                let refresh_due = async move {
                    match due_in {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = self.core.changed.notified() => continue,
                    _ = refresh_due => {
                        if let Err(e) = self.refresh_now().await {
                            warn!(error = %e, "Scheduled session refresh failed");
                        }
                    }
                }
            }
            debug!("Session refresh timer stopped");
        })
    }
}

impl SessionCore {
    async fn refresh_once(&self) -> Result<Session> {
        let current = self.require_session()?;
        debug!(user = %current.user_id, "Refreshing session");

        match retry_sync_call(
            || self.auth.refresh(&current.refresh_token),
            &self.config.retry,
        )
        .await
        {
            Ok(grant) => {
                let session = Session::from_grant(grant, &self.device_id);
                self.metrics.inc_session_refresh(true);
                if !self.replace(&current, session.clone()) {
                    debug!(user = %current.user_id, "Session changed during refresh, discarding tokens");
                    return self.require_session();
                }
                info!(
                    event = "session_refreshed",
                    user = %session.user_id,
                    expires_at = %session.expires_at,
                    "Session refreshed"
                );
                let _ = self.events.send(SessionEvent::Refreshed {
                    expires_at: session.expires_at,
                });
                Ok(session)
            }
            Err(e) => {
                self.metrics.inc_session_refresh(false);
                let imminent = self.clock.now() >= self.refresh_due_at(&current);
                if e.is_retryable() && !imminent {
                    warn!(error = %e, "Session refresh failed, will retry before expiry");
                    return Err(e);
                }
                if !self.force_reauthentication(&current, &e) {
                    return self.require_session();
                }
                Err(SyncError::SessionExpired)
            }
        }
    }

    /// Expire `current` unless it was replaced or cleared meanwhile
    fn force_reauthentication(&self, current: &Session, cause: &SyncError) -> bool {
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if !slot.holds(current) {
                return false;
            }
            slot.session = None;
            slot.state = SessionState::Expired;
            self.gate.pause();
        }
        self.changed.notify_one();

        error!(
            event = "forced_reauthentication",
            user = %current.user_id,
            error = %cause,
            "Session expired, re-authentication required"
        );
        self.sink.report(
            ErrorReport::from_error(cause)
                .with("user_id", &current.user_id)
                .with("device_id", &self.device_id)
                .with("expires_at", current.expires_at),
        );
        let _ = self.events.send(SessionEvent::ForcedReauthentication {
            reason: cause.to_string(),
        });
        true
    }

    // The gate is toggled under the slot lock so it always agrees with the
    // installed session.
    fn install(&self, session: Session) {
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            slot.session = Some(session);
            slot.state = SessionState::Active;
            self.gate.resume();
        }
        self.changed.notify_one();
    }

    /// Install `session` in place of `current`, if `current` is still installed
    fn replace(&self, current: &Session, session: Session) -> bool {
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if !slot.holds(current) {
                return false;
            }
            slot.session = Some(session);
            slot.state = SessionState::Active;
            self.gate.resume();
        }
        self.changed.notify_one();
        true
    }

    fn take_session(&self, state: SessionState) -> Option<Session> {
        let taken = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            slot.state = state;
            self.gate.pause();
            slot.session.take()
        };
        self.changed.notify_one();
        taken
    }

    fn require_session(&self) -> Result<Session> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        match (&slot.session, slot.state) {
            (Some(session), _) => Ok(session.clone()),
            (None, SessionState::Expired) => Err(SyncError::SessionExpired),
            (None, _) => Err(SyncError::NoSession),
        }
    }

    fn refresh_due_at(&self, session: &Session) -> DateTime<Utc> {
        session
            .expires_at
            .checked_sub_signed(chrono_duration(self.config.refresh_lead))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[async_trait]
impl CredentialRefresher for SessionManager {
    async fn refresh_credentials(&self) -> Result<()> {
        self.refresh_now().await.map(|_| ())
    }
}
