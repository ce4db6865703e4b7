//! Per-path, per-client-IP rate limiting (spec.md §6's rate-limiting paragraph).
//!
//! Built directly on [`crate::cache::CounterCache`] (C1) rather than a fresh
//! limiter type: a fixed 60-second window counter approximates the documented
//! leaky-bucket behavior closely enough for the two rate-limited endpoints this
//! crate has (`/ocm-aux/discover`, `/api/auth/login`), and reuses the same driver
//! instance the discovery cache already holds.

use std::time::Duration;

use crate::cache::FullCache;

const WINDOW: Duration = Duration::from_secs(60);

/// Returns `true` when the request is within `limit_per_min + burst` for this
/// `(bucket, client_ip)` pair in the current 60-second window.
pub fn allow(cache: &dyn FullCache, bucket: &str, client_ip: &str, limit_per_min: u32, burst: u32) -> bool {
    let key = format!("ratelimit:{bucket}:{client_ip}");
    let count = cache.increment(&key, 1, Some(WINDOW));
    count <= (limit_per_min + burst) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[test]
    fn allows_up_to_limit_plus_burst_then_blocks() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        for _ in 0..7 {
            assert!(allow(&cache, "discover", "203.0.113.5", 5, 2));
        }
        assert!(!allow(&cache, "discover", "203.0.113.5", 5, 2));
    }

    #[test]
    fn separate_client_ips_have_independent_buckets() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(allow(&cache, "login", "203.0.113.5", 5, 0));
        }
        assert!(!allow(&cache, "login", "203.0.113.5", 5, 0));
        assert!(allow(&cache, "login", "203.0.113.6", 5, 0));
    }

    #[test]
    fn separate_buckets_are_independent_per_path() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(allow(&cache, "login", "203.0.113.5", 5, 0));
        }
        assert!(allow(&cache, "discover", "203.0.113.5", 5, 0));
    }
}
