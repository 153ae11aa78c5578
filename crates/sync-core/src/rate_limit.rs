//! Client-side rate limiting
//!
//! Fixed-window counters keyed by `(user, action)`. This layer is advisory:
//! it refuses obviously abusive bursts before any network attempt, while the
//! backend stays authoritative.

use crate::clock::{chrono_duration, millis_until, Clock};
use crate::error::{Result, SyncError};
use crate::observability::SyncMetrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Window configuration for one action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// 10 bookings per minute
    pub fn booking() -> Self {
        Self::new(10, Duration::from_millis(60_000))
    }

    /// 5 critical alerts per hour
    pub fn critical_alert() -> Self {
        Self::new(5, Duration::from_millis(3_600_000))
    }
}

/// Rate-limited action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateAction {
    Booking,
    CriticalAlert,
    Custom(String),
}

impl RateAction {
    pub fn parse(name: &str) -> Self {
        match name {
            "booking" => RateAction::Booking,
            "critical_alert" | "critical-alert" => RateAction::CriticalAlert,
            other => RateAction::Custom(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RateAction::Booking => "booking",
            RateAction::CriticalAlert => "critical_alert",
            RateAction::Custom(name) => name,
        }
    }

    /// Built-in limit for this action, if any
    pub fn preset(&self) -> Option<RateLimitConfig> {
        match self {
            RateAction::Booking => Some(RateLimitConfig::booking()),
            RateAction::CriticalAlert => Some(RateLimitConfig::critical_alert()),
            RateAction::Custom(_) => None,
        }
    }
}

/// Counter scope: one user performing one action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateScope {
    pub user_id: String,
    pub action: RateAction,
}

impl RateScope {
    pub fn new(user_id: impl Into<String>, action: RateAction) -> Self {
        Self {
            user_id: user_id.into(),
            action,
        }
    }
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.action.name())
    }
}

/// Requests left in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRemaining {
    pub count: u32,
    pub reset_in_ms: u64,
}

#[derive(Debug, Clone)]
struct RateWindow {
    window_start: DateTime<Utc>,
    count: u32,
    config: RateLimitConfig,
}

impl RateWindow {
    fn open(now: DateTime<Utc>, config: RateLimitConfig) -> Self {
        Self {
            window_start: now,
            count: 0,
            config,
        }
    }

    fn window_end(&self) -> DateTime<Utc> {
        self.window_start
            .checked_add_signed(chrono_duration(self.config.window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn has_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end()
    }

    fn remaining(&self, now: DateTime<Utc>) -> RateRemaining {
        RateRemaining {
            count: self.config.max_requests.saturating_sub(self.count),
            reset_in_ms: millis_until(now, self.window_end()),
        }
    }
}

/// Fixed-window rate limiter
///
/// Counters live in a sharded map; each scope is updated under its shard
/// lock so concurrent callers never lose increments.
pub struct RateLimiter {
    windows: DashMap<RateScope, RateWindow>,
    clock: Arc<dyn Clock>,
    metrics: SyncMetrics,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
            metrics: SyncMetrics::new(),
        }
    }

    /// Count a request against `scope`; false once the window is full
    pub fn is_allowed(&self, scope: &RateScope, config: RateLimitConfig) -> bool {
        let now = self.clock.now();
        let mut window = self
            .windows
            .entry(scope.clone())
            .or_insert_with(|| RateWindow::open(now, config));

        if window.has_elapsed(now) {
            *window = RateWindow::open(now, config);
        }
        window.config = config;

        if window.count < config.max_requests {
            window.count += 1;
            true
        } else {
            drop(window);
            debug!(scope = %scope, "Rate limit reached");
            self.metrics.inc_rate_limited(scope.action.name());
            false
        }
    }

    /// Requests left for `scope`
    ///
    /// Unseen scopes report their preset's full allowance, or `None` when the
    /// action has no preset.
    pub fn remaining(&self, scope: &RateScope) -> Option<RateRemaining> {
        let now = self.clock.now();
        match self.windows.get(scope) {
            Some(window) if !window.has_elapsed(now) => Some(window.remaining(now)),
            Some(window) => Some(RateRemaining {
                count: window.config.max_requests,
                reset_in_ms: 0,
            }),
            None => scope.action.preset().map(|config| RateRemaining {
                count: config.max_requests,
                reset_in_ms: 0,
            }),
        }
    }

    /// Count a request using the action's preset
    ///
    /// Actions without a preset are unlimited.
    pub fn check(&self, scope: &RateScope) -> Result<()> {
        let Some(config) = scope.action.preset() else {
            return Ok(());
        };
        if self.is_allowed(scope, config) {
            return Ok(());
        }

        let reset_in_ms = self
            .remaining(scope)
            .map(|r| r.reset_in_ms)
            .unwrap_or_default();
        warn!(scope = %scope, reset_in_ms = reset_in_ms, "Request refused by rate limiter");
        Err(SyncError::RateLimitExceeded {
            scope: scope.to_string(),
            reset_in_ms,
        })
    }

    pub fn reset(&self, scope: &RateScope) {
        self.windows.remove(scope);
    }

    /// Forget scopes whose window has elapsed
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        self.windows.retain(|_, window| {
            let idle = window.has_elapsed(now);
            purged += usize::from(idle);
            !idle
        });
        purged
    }

    pub fn tracked_scopes(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (RateLimiter::new(clock.clone()), clock)
    }

    #[test]
    fn test_booking_window_allows_ten_then_resets() {
        let (limiter, clock) = limiter();
        let scope = RateScope::new("user-1", RateAction::Booking);
        let config = RateLimitConfig::new(10, Duration::from_millis(60_000));

        for call in 1..=10 {
            assert!(limiter.is_allowed(&scope, config), "call {} refused", call);
        }
        assert!(!limiter.is_allowed(&scope, config));

        clock.advance(Duration::from_millis(60_000));
        assert!(limiter.is_allowed(&scope, config));
    }

    #[test]
    fn test_critical_alert_sixth_call_rejected() {
        let (limiter, clock) = limiter();
        let scope = RateScope::new("user-1", RateAction::CriticalAlert);
        let config = RateLimitConfig::critical_alert();

        for _ in 0..5 {
            assert!(limiter.is_allowed(&scope, config));
        }
        clock.advance(Duration::from_secs(30 * 60));
        assert!(!limiter.is_allowed(&scope, config));

        let remaining = limiter.remaining(&scope).unwrap();
        assert_eq!(remaining.count, 0);
        assert_eq!(remaining.reset_in_ms, 30 * 60 * 1000);
    }

    #[test]
    fn test_actions_and_users_are_independent() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(1, Duration::from_secs(60));
        let booking = RateScope::new("user-1", RateAction::Booking);
        let alert = RateScope::new("user-1", RateAction::CriticalAlert);
        let other_user = RateScope::new("user-2", RateAction::Booking);

        assert!(limiter.is_allowed(&booking, config));
        assert!(!limiter.is_allowed(&booking, config));
        assert!(limiter.is_allowed(&alert, config));
        assert!(limiter.is_allowed(&other_user, config));
    }

    #[test]
    fn test_remaining_for_unseen_scopes() {
        let (limiter, _) = limiter();
        let remaining = limiter
            .remaining(&RateScope::new("u", RateAction::Booking))
            .unwrap();
        assert_eq!(remaining.count, 10);

        let custom = RateScope::new("u", RateAction::Custom("upload".into()));
        assert!(limiter.remaining(&custom).is_none());
        tokio_test::assert_ok!(limiter.check(&custom));
    }

    #[test]
    fn test_check_uses_presets() {
        let (limiter, _) = limiter();
        let scope = RateScope::new("user-1", RateAction::CriticalAlert);

        for _ in 0..5 {
            tokio_test::assert_ok!(limiter.check(&scope));
        }
        match limiter.check(&scope) {
            Err(SyncError::RateLimitExceeded { scope, reset_in_ms }) => {
                assert_eq!(scope, "user-1:critical_alert");
                assert_eq!(reset_in_ms, 3_600_000);
            }
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_and_purge_idle() {
        let (limiter, clock) = limiter();
        let config = RateLimitConfig::new(1, Duration::from_secs(10));
        let a = RateScope::new("a", RateAction::Booking);
        let b = RateScope::new("b", RateAction::Booking);

        assert!(limiter.is_allowed(&a, config));
        limiter.reset(&a);
        assert!(limiter.is_allowed(&a, config));

        clock.advance(Duration::from_secs(5));
        assert!(limiter.is_allowed(&b, config));
        clock.advance(Duration::from_secs(6));

        assert_eq!(limiter.purge_idle(), 1);
        assert_eq!(limiter.tracked_scopes(), 1);
    }

    #[test]
    fn test_unbounded_window_never_resets() {
        let (limiter, clock) = limiter();
        let scope = RateScope::new("user-1", RateAction::Custom("export".into()));
        let config = RateLimitConfig::new(1, Duration::MAX);

        assert!(limiter.is_allowed(&scope, config));
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(!limiter.is_allowed(&scope, config));
        assert_eq!(limiter.purge_idle(), 0);
    }

    #[test]
    fn test_purge_idle_alongside_concurrent_checks() {
        let (limiter, _) = limiter();
        let limiter = Arc::new(limiter);
        let config = RateLimitConfig::new(1, Duration::from_secs(60));

        let writer = {
            let limiter = Arc::clone(&limiter);
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    let scope = RateScope::new(format!("user-{}", i), RateAction::Booking);
                    assert!(limiter.is_allowed(&scope, config));
                }
            })
        };
        while !writer.is_finished() {
            assert_eq!(limiter.purge_idle(), 0);
        }
        writer.join().unwrap();

        assert_eq!(limiter.tracked_scopes(), 2_000);
    }
}
