//! TTL-bounded read cache
//!
//! Server-fetched entities are cached in the durable store under
//! `cache/<namespace>/<id>`. A read returns the value only while the entry is
//! fresh and was written with the current schema version; anything else is
//! an absent read and the entry is purged. Reads never fail.
//!
//! Every mutation, including the purge a read triggers, runs under one write
//! lock so check-then-write sequences cannot interleave.

use crate::clock::{chrono_duration, Clock};
use crate::error::{Result, StoreError};
use crate::observability::SyncMetrics;
use crate::retry::{retry_sync_call, RetryConfig};
use crate::store::DurableStore;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Schema version written with every entry; bump when cached shapes change
pub const CACHE_SCHEMA_VERSION: u32 = 1;

const CACHE_PREFIX: &str = "cache/";

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub schema_version: u32,
    /// TTL for list-type collections
    pub list_ttl: Duration,
    /// TTL for profile and user-scoped entities
    pub profile_ttl: Duration,
    /// TTL for single-item detail views
    pub detail_ttl: Duration,
    /// Retry policy for read-through fetches
    pub fetch_retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            list_ttl: Duration::from_secs(15 * 60),
            profile_ttl: Duration::from_secs(60 * 60),
            detail_ttl: Duration::from_secs(10 * 60),
            fetch_retry: RetryConfig::api(),
        }
    }
}

/// Cache namespace, which determines the default TTL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    List,
    Profile,
    Detail,
    Custom { name: String, ttl: Duration },
}

impl CacheNamespace {
    pub fn name(&self) -> &str {
        match self {
            CacheNamespace::List => "list",
            CacheNamespace::Profile => "profile",
            CacheNamespace::Detail => "detail",
            CacheNamespace::Custom { name, .. } => name,
        }
    }

    /// Parse a built-in namespace name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "list" => Some(CacheNamespace::List),
            "profile" => Some(CacheNamespace::Profile),
            "detail" => Some(CacheNamespace::Detail),
            _ => None,
        }
    }

    fn default_ttl(&self, config: &CacheConfig) -> Duration {
        match self {
            CacheNamespace::List => config.list_ttl,
            CacheNamespace::Profile => config.profile_ttl,
            CacheNamespace::Detail => config.detail_ttl,
            CacheNamespace::Custom { ttl, .. } => *ttl,
        }
    }

    fn storage_prefix(&self) -> String {
        format!("{}{}/", CACHE_PREFIX, self.name())
    }
}

/// Address of a cached entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: CacheNamespace,
    pub id: String,
}

impl CacheKey {
    pub fn new(namespace: CacheNamespace, id: impl Into<String>) -> Self {
        Self {
            namespace,
            id: id.into(),
        }
    }

    pub fn list(id: impl Into<String>) -> Self {
        Self::new(CacheNamespace::List, id)
    }

    pub fn profile(id: impl Into<String>) -> Self {
        Self::new(CacheNamespace::Profile, id)
    }

    pub fn detail(id: impl Into<String>) -> Self {
        Self::new(CacheNamespace::Detail, id)
    }

    fn storage_key(&self) -> String {
        format!("{}{}", self.namespace.storage_prefix(), self.id)
    }
}

/// Persisted cache record
///
/// `version_at` orders competing writes (last write wins); `stored_at` drives
/// expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub schema_version: u32,
    pub stored_at: DateTime<Utc>,
    pub version_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.stored_at < chrono_duration(Duration::from_millis(self.ttl_ms))
    }
}

/// Counters for cache reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Misses caused by expiry or schema mismatch
    pub stale: u64,
    pub entries: usize,
}

/// TTL-bounded, schema-versioned cache over the durable store
pub struct Cache {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    metrics: SyncMetrics,
    write_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
}

/// Outcome of a read, carrying the raw bytes it judged
enum Lookup {
    Fresh {
        value: serde_json::Value,
        bytes: Vec<u8>,
    },
    Stale(Vec<u8>),
    Absent,
}

impl Cache {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            store,
            clock,
            config,
            metrics: SyncMetrics::new(),
            write_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Read a fresh value; stale, incompatible or missing entries are absent
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let storage_key = key.storage_key();
        let (value, bytes) = match self.lookup(&storage_key) {
            Lookup::Fresh { value, bytes } => (value, bytes),
            Lookup::Stale(bytes) => {
                self.stale.fetch_add(1, Ordering::Relaxed);
                self.record_miss();
                self.purge_if_unchanged(&storage_key, &bytes);
                return None;
            }
            Lookup::Absent => {
                self.record_miss();
                return None;
            }
        };

        match serde_json::from_value(value) {
            Ok(decoded) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.metrics.inc_cache_hit();
                Some(decoded)
            }
            Err(e) => {
                debug!(key = %storage_key, error = %e, "Cached value has unexpected shape, purging");
                self.record_miss();
                self.purge_if_unchanged(&storage_key, &bytes);
                None
            }
        }
    }

    /// Store a value with the namespace TTL unless `ttl` overrides it
    pub fn set<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Option<Duration>) -> Result<()> {
        let _guard = self.write_guard();
        let now = self.clock.now();
        self.write(key, value, ttl, now, now)
    }

    /// Store a remotely confirmed value unless a newer write is already cached
    ///
    /// Returns whether the value was written.
    pub fn set_if_newer<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        observed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let storage_key = key.storage_key();
        let _guard = self.write_guard();
        if let Some(existing) = self.read_envelope(&storage_key) {
            if existing.version_at > observed_at {
                debug!(key = %storage_key, "Skipping older write");
                return Ok(false);
            }
        }
        self.write(key, value, None, self.clock.now(), observed_at)?;
        Ok(true)
    }

    pub fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let _guard = self.write_guard();
        self.store.delete(&key.storage_key())?;
        Ok(())
    }

    /// Drop every entry in a namespace, returning how many were removed
    pub fn clear(&self, namespace: &CacheNamespace) -> Result<usize> {
        self.delete_prefix(&namespace.storage_prefix())
    }

    /// Drop every cached entry
    pub fn clear_all(&self) -> Result<usize> {
        self.delete_prefix(CACHE_PREFIX)
    }

    /// Eagerly remove expired and incompatible entries
    pub fn purge_expired(&self) -> Result<usize> {
        let _guard = self.write_guard();
        let now = self.clock.now();
        let mut purged = 0;
        for (key, bytes) in self.store.list_prefix(CACHE_PREFIX)? {
            let keep = serde_json::from_slice::<CacheEntry<serde_json::Value>>(&bytes)
                .map(|e| e.schema_version == self.config.schema_version && e.is_fresh(now))
                .unwrap_or(false);
            if !keep {
                self.store.delete(&key)?;
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(purged = purged, "Purged expired cache entries");
        }
        Ok(purged)
    }

    /// Read-through: serve from cache, else fetch via the retry engine and store
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(cached) = self.get(key) {
            return Ok(cached);
        }

        let value = retry_sync_call(fetch, &self.config.fetch_retry).await?;
        if let Err(e) = self.set(key, &value, None) {
            warn!(key = %key.storage_key(), error = %e, "Failed to cache fetched value");
        }
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            entries: self
                .store
                .list_prefix(CACHE_PREFIX)
                .map(|entries| entries.len())
                .unwrap_or(0),
        }
    }

    fn write<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
        stored_at: DateTime<Utc>,
        version_at: DateTime<Utc>,
    ) -> Result<()> {
        let storage_key = key.storage_key();
        let ttl = ttl.unwrap_or_else(|| key.namespace.default_ttl(&self.config));
        let entry = CacheEntry {
            key: storage_key.clone(),
            value,
            schema_version: self.config.schema_version,
            stored_at,
            version_at,
            ttl_ms: ttl.as_millis() as u64,
        };
        let bytes =
            serde_json::to_vec(&entry).map_err(|e| StoreError::codec(storage_key.as_str(), e))?;
        self.store.put(&storage_key, &bytes)?;
        Ok(())
    }

    fn read_envelope(&self, storage_key: &str) -> Option<CacheEntry<serde_json::Value>> {
        match self.store.get(storage_key) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    fn lookup(&self, storage_key: &str) -> Lookup {
        let bytes = match self.store.get(storage_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Lookup::Absent,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Cache read failed, treating as miss");
                return Lookup::Absent;
            }
        };

        // Only the envelope is decoded here; the value is left untyped until
        // the schema version has been checked.
        let Ok(entry) = serde_json::from_slice::<CacheEntry<serde_json::Value>>(&bytes) else {
            return Lookup::Stale(bytes);
        };

        if entry.schema_version != self.config.schema_version {
            debug!(
                key = %storage_key,
                stored = entry.schema_version,
                current = self.config.schema_version,
                "Schema version mismatch"
            );
            return Lookup::Stale(bytes);
        }
        if !entry.is_fresh(self.clock.now()) {
            return Lookup::Stale(bytes);
        }
        Lookup::Fresh {
            value: entry.value,
            bytes,
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_cache_miss();
    }

    /// Delete the entry only if it still holds `judged`
    ///
    /// A write that landed after the read was judged stale is kept.
    fn purge_if_unchanged(&self, storage_key: &str, judged: &[u8]) {
        let _guard = self.write_guard();
        match self.store.get(storage_key) {
            Ok(Some(current)) if current == judged => {
                if let Err(e) = self.store.delete(storage_key) {
                    warn!(key = %storage_key, error = %e, "Failed to purge cache entry");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(key = %storage_key, error = %e, "Failed to purge cache entry"),
        }
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let _guard = self.write_guard();
        let keys = self.store.list_prefix(prefix)?;
        for (key, _) in &keys {
            self.store.delete(key)?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::SyncError;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ride {
        id: String,
        seats: u32,
    }

    fn ride() -> Ride {
        Ride {
            id: "ride-1".into(),
            seats: 3,
        }
    }

    fn setup() -> (Cache, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new());
        let cache = Cache::new(store.clone(), clock.clone(), CacheConfig::default());
        (cache, clock, store)
    }

    #[test]
    fn test_set_then_get_round_trips_until_ttl() {
        let (cache, clock, _) = setup();
        let key = CacheKey::detail("ride-1");

        cache.set(&key, &ride(), Some(Duration::from_secs(30))).unwrap();
        assert_eq!(cache.get::<Ride>(&key), Some(ride()));

        clock.advance(Duration::from_secs(29));
        assert_eq!(cache.get::<Ride>(&key), Some(ride()));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get::<Ride>(&key), None);
    }

    #[test]
    fn test_namespace_default_ttls() {
        let (cache, clock, _) = setup();
        let list = CacheKey::list("rides");
        let profile = CacheKey::profile("user-1");
        let detail = CacheKey::detail("ride-1");

        cache.set(&list, &vec![ride()], None).unwrap();
        cache.set(&profile, &"Ada", None).unwrap();
        cache.set(&detail, &ride(), None).unwrap();

        clock.advance(Duration::from_secs(10 * 60));
        assert!(cache.get::<Ride>(&detail).is_none());
        assert!(cache.get::<Vec<Ride>>(&list).is_some());

        clock.advance(Duration::from_secs(5 * 60));
        assert!(cache.get::<Vec<Ride>>(&list).is_none());
        assert!(cache.get::<String>(&profile).is_some());

        clock.advance(Duration::from_secs(45 * 60));
        assert!(cache.get::<String>(&profile).is_none());
    }

    #[test]
    fn test_schema_mismatch_is_a_miss_and_purges() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new());
        let old = Cache::new(store.clone(), clock.clone(), CacheConfig::default());
        let key = CacheKey::detail("ride-1");
        old.set(&key, &ride(), None).unwrap();

        let upgraded = Cache::new(
            store.clone(),
            clock,
            CacheConfig {
                schema_version: CACHE_SCHEMA_VERSION + 1,
                ..Default::default()
            },
        );
        assert_eq!(upgraded.get::<Ride>(&key), None);
        assert!(store.is_empty());
        assert_eq!(upgraded.stats().stale, 1);
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let (cache, _, store) = setup();
        let key = CacheKey::detail("ride-1");
        store.put(&key.storage_key(), b"{garbage").unwrap();

        assert_eq!(cache.get::<Ride>(&key), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalidate_and_clear_namespace() {
        let (cache, _, _) = setup();
        cache.set(&CacheKey::detail("a"), &1, None).unwrap();
        cache.set(&CacheKey::detail("b"), &2, None).unwrap();
        cache.set(&CacheKey::list("all"), &vec![1, 2], None).unwrap();

        cache.invalidate(&CacheKey::detail("a")).unwrap();
        assert_eq!(cache.get::<i32>(&CacheKey::detail("a")), None);

        assert_eq!(cache.clear(&CacheNamespace::Detail).unwrap(), 1);
        assert_eq!(cache.get::<i32>(&CacheKey::detail("b")), None);
        assert_eq!(cache.get::<Vec<i32>>(&CacheKey::list("all")), Some(vec![1, 2]));
    }

    #[test]
    fn test_set_if_newer_is_last_write_wins() {
        let (cache, clock, _) = setup();
        let key = CacheKey::detail("ride-1");
        let t0 = clock.now();

        assert!(cache
            .set_if_newer(&key, &ride(), t0 + chrono::Duration::seconds(10))
            .unwrap());
        let older = Ride {
            seats: 1,
            ..ride()
        };
        assert!(!cache.set_if_newer(&key, &older, t0).unwrap());
        assert_eq!(cache.get::<Ride>(&key), Some(ride()));
    }

    #[test]
    fn test_concurrent_confirmed_writes_keep_newest() {
        let (cache, clock, _) = setup();
        let key = CacheKey::detail("ride-1");
        let t0 = clock.now();

        // Each thread writes its share of versions, newest first, so older
        // writes constantly race against newer ones.
        std::thread::scope(|scope| {
            for worker in 0..8u32 {
                let (cache, key) = (&cache, &key);
                scope.spawn(move || {
                    for version in (0..400u32).rev().filter(|v| v % 8 == worker) {
                        let observed_at = t0 + chrono::Duration::seconds(i64::from(version));
                        cache.set_if_newer(key, &version, observed_at).unwrap();
                    }
                });
            }
        });

        assert_eq!(cache.get::<u32>(&key), Some(399));
    }

    #[test]
    fn test_stale_purge_keeps_newer_write() {
        let (cache, clock, store) = setup();
        let key = CacheKey::detail("ride-1");
        cache.set(&key, &ride(), Some(Duration::from_secs(1))).unwrap();
        clock.advance(Duration::from_secs(2));

        let Lookup::Stale(judged) = cache.lookup(&key.storage_key()) else {
            panic!("expected a stale entry");
        };
        // A fresh write lands between the stale read and its purge.
        cache.set(&key, &ride(), None).unwrap();
        cache.purge_if_unchanged(&key.storage_key(), &judged);

        assert!(!store.is_empty());
        assert_eq!(cache.get::<Ride>(&key), Some(ride()));
    }

    #[test]
    fn test_purge_expired() {
        let (cache, clock, store) = setup();
        cache
            .set(&CacheKey::detail("short"), &1, Some(Duration::from_secs(1)))
            .unwrap();
        cache.set(&CacheKey::profile("long"), &2, None).unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_fetch_reads_through_once() {
        let (cache, _, _) = setup();
        let key = CacheKey::detail("ride-1");
        let fetches = AtomicU32::new(0);

        for _ in 0..3 {
            let value: Ride = cache
                .get_or_fetch(&key, || {
                    let n = fetches.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(SyncError::TransientNetwork("flaky".into()))
                        } else {
                            Ok(ride())
                        }
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, ride());
        }

        // One failed attempt, one success, then served from cache.
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entries, 1);
    }
}
