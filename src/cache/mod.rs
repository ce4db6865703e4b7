//! C1 — TTL cache.
//!
//! A keyed byte-blob store with per-entry TTL, a counter facet, and a background
//! sweeper. Drivers are registered by name in a [`CacheRegistry`] built once at
//! startup; the default driver is the in-memory one. Values handed to and returned
//! from the cache are always independent copies of the caller's buffers, so mutation
//! on either side can never corrupt the other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unknown cache driver: {0}")]
    UnknownDriver(String),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

/// Byte-blob capability: `Get`/`Set`/`Delete`/`Exists`/`Close`.
pub trait Cache: Send + Sync {
    /// Returns `None` if absent or expired. The returned buffer is an independent copy.
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    /// `ttl = None` uses the driver's default TTL. The stored buffer is an independent copy.
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>);
    fn delete(&self, key: &str);
    fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
    fn close(&self);
}

/// Counter capability, layered on top of a [`Cache`] driver that supports it.
pub trait CounterCache: Send + Sync {
    /// Increments (creating with `ttl` on first touch) and returns the new value.
    fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> i64;
    /// Returns 0 for an absent or expired key.
    fn get_count(&self, key: &str) -> i64;
    fn reset(&self, key: &str);
}

/// The default in-memory driver. Implements both [`Cache`] and [`CounterCache`].
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    default_ttl: Duration,
}

impl MemoryCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), default_ttl }
    }

    /// Removes every entry whose TTL has elapsed. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.entries.write();
        let before = guard.len();
        guard.retain(|_, e| !e.is_expired(now));
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let guard = self.entries.read();
        match guard.get(key) {
            Some(e) if !e.is_expired(now) => Some(e.value.clone()),
            _ => None,
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = if ttl.is_zero() { None } else { Some(Instant::now() + ttl) };
        self.entries
            .write()
            .insert(key.to_string(), Entry { value: value.to_vec(), expires_at });
    }

    fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    fn close(&self) {
        self.entries.write().clear();
    }
}

impl CounterCache for MemoryCache {
    fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> i64 {
        let now = Instant::now();
        let mut guard = self.entries.write();
        let entry = guard.entry(key.to_string()).or_insert_with(|| {
            let ttl = ttl.unwrap_or(self.default_ttl);
            let expires_at = if ttl.is_zero() { None } else { Some(now + ttl) };
            Entry { value: 0i64.to_le_bytes().to_vec(), expires_at }
        });
        if entry.is_expired(now) {
            let ttl = ttl.unwrap_or(self.default_ttl);
            entry.expires_at = if ttl.is_zero() { None } else { Some(now + ttl) };
            entry.value = 0i64.to_le_bytes().to_vec();
        }
        let current = i64::from_le_bytes(entry.value.clone().try_into().unwrap_or([0; 8]));
        let next = current + delta;
        entry.value = next.to_le_bytes().to_vec();
        next
    }

    fn get_count(&self, key: &str) -> i64 {
        match self.get(key) {
            Some(v) => i64::from_le_bytes(v.try_into().unwrap_or([0; 8])),
            None => 0,
        }
    }

    fn reset(&self, key: &str) {
        self.set(key, &0i64.to_le_bytes(), None);
    }
}

/// A driver that is both a [`Cache`] and a [`CounterCache`] (the shape every built-in
/// driver implements; spec §9 models this as "two capability records").
pub trait FullCache: Cache + CounterCache {}
impl<T: Cache + CounterCache> FullCache for T {}

type DriverFactory = Box<dyn Fn(Duration) -> Arc<dyn FullCache> + Send + Sync>;

/// Constructor map built once at startup, replacing module-init driver registration.
pub struct CacheRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl Default for CacheRegistry {
    fn default() -> Self {
        let mut registry = Self { factories: HashMap::new() };
        registry.register("memory", |ttl| Arc::new(MemoryCache::new(ttl)));
        registry
    }
}

impl CacheRegistry {
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(Duration) -> Arc<dyn FullCache> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn build(&self, driver: &str, default_ttl: Duration) -> Result<Arc<dyn FullCache>, CacheError> {
        self.factories
            .get(driver)
            .map(|f| f(default_ttl))
            .ok_or_else(|| CacheError::UnknownDriver(driver.to_string()))
    }
}

/// Spawns the background sweeper for a [`MemoryCache`]. The interval is caller
/// controlled but must be bounded (spec §4.1); callers should pick something on the
/// order of a fraction of the shortest TTL in use.
pub fn spawn_sweeper(cache: Arc<MemoryCache>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = cache.sweep();
            if removed > 0 {
                tracing::debug!(removed, "cache sweep removed expired entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_none_for_absent_key() {
        let c = MemoryCache::new(Duration::from_secs(60));
        assert_eq!(c.get("missing"), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let c = MemoryCache::new(Duration::from_secs(60));
        c.set("k", b"hello", None);
        assert_eq!(c.get("k"), Some(b"hello".to_vec()));
    }

    #[test]
    fn ttl_zero_means_no_expiry() {
        let c = MemoryCache::new(Duration::from_secs(60));
        c.set("k", b"v", Some(Duration::ZERO));
        assert_eq!(c.get("k"), Some(b"v".to_vec()));
    }

    #[test]
    fn expired_entry_is_logically_absent() {
        let c = MemoryCache::new(Duration::from_millis(1));
        c.set("k", b"v", Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(c.get("k"), None);
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let c = MemoryCache::new(Duration::from_millis(1));
        c.set("k", b"v", Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(c.sweep(), 1);
        assert!(c.is_empty());
    }

    #[test]
    fn value_isolation_caller_mutation_does_not_corrupt_cache() {
        let c = MemoryCache::new(Duration::from_secs(60));
        let mut buf = vec![1, 2, 3];
        c.set("k", &buf, None);
        buf[0] = 99;
        assert_eq!(c.get("k"), Some(vec![1, 2, 3]));

        let mut out = c.get("k").unwrap();
        out[0] = 42;
        assert_eq!(c.get("k"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn delete_removes_key() {
        let c = MemoryCache::new(Duration::from_secs(60));
        c.set("k", b"v", None);
        c.delete("k");
        assert!(!c.exists("k"));
    }

    #[test]
    fn increment_creates_with_ttl_on_first_touch() {
        let c = MemoryCache::new(Duration::from_secs(60));
        assert_eq!(c.increment("hits", 1, Some(Duration::from_secs(5))), 1);
        assert_eq!(c.increment("hits", 2, Some(Duration::from_secs(5))), 3);
    }

    #[test]
    fn get_count_is_zero_for_absent_key() {
        let c = MemoryCache::new(Duration::from_secs(60));
        assert_eq!(c.get_count("nope"), 0);
    }

    #[test]
    fn reset_sets_counter_to_zero() {
        let c = MemoryCache::new(Duration::from_secs(60));
        c.increment("hits", 5, None);
        c.reset("hits");
        assert_eq!(c.get_count("hits"), 0);
    }

    #[test]
    fn unknown_driver_fails_construction() {
        let registry = CacheRegistry::default();
        assert!(matches!(
            registry.build("redis", Duration::from_secs(60)),
            Err(CacheError::UnknownDriver(name)) if name == "redis"
        ));
    }

    #[test]
    fn default_driver_is_memory() {
        let registry = CacheRegistry::default();
        let cache = registry.build("memory", Duration::from_secs(60)).unwrap();
        cache.set("k", b"v", None);
        assert_eq!(cache.get("k"), Some(b"v".to_vec()));
    }
}
