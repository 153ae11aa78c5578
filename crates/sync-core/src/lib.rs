//! Offline-resilience and synchronization core
//!
//! This crate provides the pieces a mobile client needs to stay usable while
//! connectivity comes and goes:
//! - Durable key-value storage surviving restarts
//! - Retry engine with exponential backoff, jitter and per-attempt timeouts
//! - TTL-bounded, schema-versioned read cache
//! - Per-user, per-action rate limiting
//! - Durable, priority-ordered mutation queue with dead-lettering
//! - Realtime subscription manager with reconnection
//! - Session manager with single-flight token refresh
//! - Health checks and observability

pub mod cache;
pub mod clock;
pub mod error;
pub mod flight;
pub mod health;
pub mod observability;
pub mod queue;
pub mod rate_limit;
pub mod realtime;
pub mod retry;
pub mod session;
pub mod sink;
pub mod store;

#[cfg(test)]
mod testing;

pub use cache::{Cache, CacheConfig, CacheKey, CacheNamespace, CacheStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorCategory, Result, StoreError, SyncError};
pub use flight::{FlightAbandoned, SingleFlight};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use observability::{StructuredLogger, SyncMetrics};
pub use queue::{
    DrainGate, DrainReport, DrainScheduler, DrainTrigger, Executor, OperationAction,
    OperationKind, OperationStatus, QueueConfig, QueueEvent, QueueStats, QueuedOperation,
    SyncQueue,
};
pub use rate_limit::{RateAction, RateLimitConfig, RateLimiter, RateRemaining, RateScope};
pub use realtime::{
    ChangeEvent, ChangeKind, ChannelKey, ConnectivityEvent, PubSubProvider, PushMessage,
    RealtimeConfig, RealtimeManager, ResourceFilter, SubscriptionHandle, SubscriptionHandlers,
    SubscriptionState,
};
pub use retry::{execute_with_retry, retry_sync_call, AttemptError, AttemptRecord, RetryConfig, RetryFailure};
pub use session::{
    AuthProvider, CredentialRefresher, Credentials, DeviceInfo, Session, SessionConfig,
    SessionEvent, SessionManager, SessionState, TokenGrant,
};
pub use sink::{ErrorReport, ErrorSink};
pub use store::{DurableStore, FileStore, MemoryStore};
