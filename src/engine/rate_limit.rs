use crate::util::logging::debug;
use hearthmap_common::cache::CacheHandle;
use hearthmap_common::keys;
use std::sync::Arc;

/// Fixed 60-second window per (action, user), counted in the cache. Bursts
/// straddling a window boundary get through; that is the accepted tradeoff
/// for keeping the counter a single TTL'd key. Cache loss means no limiting.
pub struct RateLimiter {
    cache: Arc<dyn CacheHandle>,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn CacheHandle>) -> Self {
        Self { cache }
    }

    pub fn allow(&self, action: &str, user_id: i64, max_per_minute: u32) -> bool {
        let key = keys::rate_limit(action, user_id);
        match self.cache.incr(&key, keys::RATE_LIMIT_TTL) {
            Ok(count) => count <= u64::from(max_per_minute),
            Err(e) => {
                debug!("rate-limit counter unavailable, allowing: {:#}", e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use hearthmap_common::cache::MemoryCache;
    use std::time::Duration;

    #[test]
    fn allows_up_to_max_then_denies_within_the_window() {
        let limiter = RateLimiter::new(Arc::new(MemoryCache::new()));
        assert!(limiter.allow("update", 1, 3));
        assert!(limiter.allow("update", 1, 3));
        assert!(limiter.allow("update", 1, 3));
        assert!(!limiter.allow("update", 1, 3));
        assert!(!limiter.allow("update", 1, 3));
    }

    #[test]
    fn windows_are_per_action_and_per_user() {
        let limiter = RateLimiter::new(Arc::new(MemoryCache::new()));
        assert!(limiter.allow("update", 1, 1));
        assert!(!limiter.allow("update", 1, 1));
        assert!(limiter.allow("update", 2, 1));
        assert!(limiter.allow("directions", 1, 1));
    }

    #[test]
    fn window_expiry_resets_the_counter() {
        // The limiter itself always uses the 60 s production TTL; the
        // counter-reset behavior is covered against the cache primitive.
        let cache = MemoryCache::new();
        let ttl = Duration::from_millis(30);
        assert_eq!(cache.incr("rl:update:1", ttl).unwrap(), 1);
        assert_eq!(cache.incr("rl:update:1", ttl).unwrap(), 2);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.incr("rl:update:1", ttl).unwrap(), 1);
    }

    struct BrokenCache;

    impl CacheHandle for BrokenCache {
        fn get_raw(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Err(anyhow!("cache offline"))
        }
        fn set_raw(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Option<Duration>,
        ) -> anyhow::Result<()> {
            Err(anyhow!("cache offline"))
        }
        fn delete(&self, _key: &str) -> anyhow::Result<()> {
            Err(anyhow!("cache offline"))
        }
        fn delete_prefix(&self, _prefix: &str) -> anyhow::Result<()> {
            Err(anyhow!("cache offline"))
        }
        fn incr(&self, _key: &str, _ttl: Duration) -> anyhow::Result<u64> {
            Err(anyhow!("cache offline"))
        }
        fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<bool> {
            Err(anyhow!("cache offline"))
        }
    }

    #[test]
    fn cache_loss_fails_open_to_allowing() {
        let limiter = RateLimiter::new(Arc::new(BrokenCache));
        for _ in 0..20 {
            assert!(limiter.allow("update", 1, 1));
        }
    }
}
