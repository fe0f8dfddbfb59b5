//! TTL cache in front of the counter store.
//!
//! Counts below [`TtlPolicy::threshold`] move quickly relative to their size and
//! are kept briefly; larger counts are kept for a day. A cached count of 0 or 1
//! is never trusted on its own (see [`needs_read_through`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{DEFAULT_LONG_TTL_SECS, DEFAULT_SHORT_TTL_SECS, DEFAULT_TTL_THRESHOLD};
use crate::store::PageId;

const VIEW_COUNT_PREFIX: &str = "viewcount";
pub const SITE_TOTAL_KEY: &str = "sitestats:total";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn view_count(page_id: PageId) -> Self {
        Self(format!("{VIEW_COUNT_PREFIX}:{page_id}"))
    }

    pub fn site_total() -> Self {
        Self(SITE_TOTAL_KEY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key-value cache service holding unsigned counts with a per-entry TTL.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<u64>;
    fn put(&self, key: &str, value: u64, ttl: Duration);
    fn delete(&self, key: &str);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock();
        *offset = offset.saturating_add(by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    // None when the deadline does not fit into an Instant.
    expires_at: Option<Instant>,
}

/// In-process [`CacheBackend`]. Expired entries read as misses and are evicted on access.
#[derive(Debug)]
pub struct MemoryCache<C = SystemClock> {
    entries: Mutex<HashMap<String, Entry>>,
    clock: C,
}

impl MemoryCache<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryCache<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryCache<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Time left before `key` expires, or `None` when it is absent or already expired.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        match entry.expires_at {
            Some(deadline) if deadline <= now => None,
            Some(deadline) => Some(deadline - now),
            None => Some(Duration::MAX),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<C: Clock> CacheBackend for MemoryCache<C> {
    fn get(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = *entries.get(key)?;
        match entry.expires_at {
            Some(deadline) if deadline <= now => {
                entries.remove(key);
                None
            }
            _ => Some(entry.value),
        }
    }

    fn put(&self, key: &str, value: u64, ttl: Duration) {
        let expires_at = self.clock.now().checked_add(ttl);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
    }

    fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Picks the TTL for a cached count from its magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub threshold: u64,
    pub short_ttl: Duration,
    pub long_ttl: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_TTL_THRESHOLD,
            short_ttl: Duration::from_secs(DEFAULT_SHORT_TTL_SECS),
            long_ttl: Duration::from_secs(DEFAULT_LONG_TTL_SECS),
        }
    }
}

impl TtlPolicy {
    pub fn ttl_for(&self, value: u64) -> Duration {
        if value < self.threshold {
            self.short_ttl
        } else {
            self.long_ttl
        }
    }
}

/// Whether a cached count must be confirmed against the store.
///
/// Misses, 0 and 1 all qualify: a freshly initialised counter reads as 1 and
/// cannot be told apart from one that was never computed.
pub fn needs_read_through(cached: Option<u64>) -> bool {
    !matches!(cached, Some(value) if value > 1)
}

/// Invalidation count of a key, taken before a store read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

/// Counter-aware view over a [`CacheBackend`].
///
/// Every [`invalidate`](Self::invalidate) bumps a per-key generation held by
/// this value and its clones. A read-through that started before the bump
/// must not write back what it read, so it goes through
/// [`put_if_current`](Self::put_if_current).
#[derive(Clone)]
pub struct CounterCache {
    backend: Arc<dyn CacheBackend>,
    policy: TtlPolicy,
    // One entry per key ever invalidated.
    generations: Arc<Mutex<HashMap<CacheKey, u64>>>,
}

impl CounterCache {
    pub fn new(backend: Arc<dyn CacheBackend>, policy: TtlPolicy) -> Self {
        Self {
            backend,
            policy,
            generations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    pub fn get(&self, key: &CacheKey) -> Option<u64> {
        self.backend.get(key.as_str())
    }

    /// Stores `value` under `key` and returns the TTL that was applied.
    pub fn put(&self, key: &CacheKey, value: u64) -> Duration {
        let ttl = self.policy.ttl_for(value);
        debug!(key = %key, value, ttl_secs = ttl.as_secs(), "caching counter");
        self.backend.put(key.as_str(), value, ttl);
        ttl
    }

    pub fn generation(&self, key: &CacheKey) -> Generation {
        Generation(self.generations.lock().get(key).copied().unwrap_or(0))
    }

    /// Like [`put`](Self::put), but does nothing when `key` was invalidated
    /// after `seen` was taken. Returns the TTL when the value was stored.
    pub fn put_if_current(
        &self,
        key: &CacheKey,
        value: u64,
        seen: Generation,
    ) -> Option<Duration> {
        let generations = self.generations.lock();
        let current = generations.get(key).copied().unwrap_or(0);
        if current != seen.0 {
            debug!(key = %key, value, "counter changed during read; not caching");
            return None;
        }
        Some(self.put(key, value))
    }

    pub fn invalidate(&self, key: &CacheKey) {
        debug!(key = %key, "invalidating counter");
        let mut generations = self.generations.lock();
        let generation = generations.entry(key.clone()).or_insert(0);
        *generation = generation.wrapping_add(1);
        self.backend.delete(key.as_str());
    }
}

impl fmt::Debug for CounterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterCache")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
