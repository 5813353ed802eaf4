use anyhow::{Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Namespaced key/value cache with per-entry TTLs. Injected into every
/// component that wants one; never held as a global. The cache is soft state:
/// the store stays authoritative, and callers fail open when a cache call
/// errors.
pub trait CacheHandle: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<String>>;
    fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn delete_prefix(&self, prefix: &str) -> Result<()>;
    /// Counter primitive: creates the key at 1 with `ttl` when absent or
    /// expired, otherwise increments without touching the expiry. Returns the
    /// post-increment count.
    fn incr(&self, key: &str, ttl: Duration) -> Result<u64>;
    /// Lease primitive: stores the value only when the key is absent or
    /// expired. Returns whether the caller now holds the key.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
}

pub fn get_json<T: DeserializeOwned>(cache: &dyn CacheHandle, key: &str) -> Result<Option<T>> {
    match cache.get_raw(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn set_json<T: Serialize>(
    cache: &dyn CacheHandle,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    cache.set_raw(key, &raw, ttl)
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now < at,
            None => true,
        }
    }
}

/// In-process cache backend. Expired entries are dropped lazily on read and
/// swept opportunistically once the map grows past a soft cap.
pub struct MemoryCache {
    map: Mutex<HashMap<String, Entry>>,
    sweep_threshold: usize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_sweep_threshold(4096)
    }

    pub fn with_sweep_threshold(sweep_threshold: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            sweep_threshold: sweep_threshold.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.map.lock().map_err(|_| anyhow!("cache mutex poisoned"))
    }

    fn sweep_if_needed(map: &mut HashMap<String, Entry>, threshold: usize, now: Instant) {
        if map.len() <= threshold {
            return;
        }
        map.retain(|_, entry| entry.live(now));
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheHandle for MemoryCache {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut map = self.lock()?;
        match map.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let mut map = self.lock()?;
        Self::sweep_if_needed(&mut map, self.sweep_threshold, now);
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.lock()?.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    fn incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut map = self.lock()?;
        match map.get_mut(key) {
            Some(entry) if entry.live(now) => {
                let count: u64 = entry.value.parse().unwrap_or(0);
                let next = count.saturating_add(1);
                entry.value = next.to_string();
                Ok(next)
            }
            _ => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: Some(now + ttl),
                    },
                );
                Ok(1)
            }
        }
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.lock()?;
        if map.get(key).is_some_and(|entry| entry.live(now)) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn set_and_get_roundtrip() {
        let cache = MemoryCache::new();
        cache.set_raw("k", "v", None).unwrap();
        assert_eq!(cache.get_raw("k").unwrap().as_deref(), Some("v"));
        cache.delete("k").unwrap();
        assert_eq!(cache.get_raw("k").unwrap(), None);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = MemoryCache::new();
        cache
            .set_raw("k", "v", Some(Duration::from_millis(20)))
            .unwrap();
        assert!(cache.get_raw("k").unwrap().is_some());
        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get_raw("k").unwrap(), None);
    }

    #[test]
    fn incr_counts_within_window_and_resets_after_expiry() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_millis(40);
        assert_eq!(cache.incr("rl", ttl).unwrap(), 1);
        assert_eq!(cache.incr("rl", ttl).unwrap(), 2);
        assert_eq!(cache.incr("rl", ttl).unwrap(), 3);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.incr("rl", ttl).unwrap(), 1, "window restarts at 1");
    }

    #[test]
    fn set_if_absent_acts_as_a_lease() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_millis(40);
        assert!(cache.set_if_absent("lease", "a", ttl).unwrap());
        assert!(!cache.set_if_absent("lease", "b", ttl).unwrap());
        thread::sleep(Duration::from_millis(60));
        assert!(
            cache.set_if_absent("lease", "c", ttl).unwrap(),
            "expired lease is claimable"
        );
    }

    #[test]
    fn delete_prefix_clears_a_key_family() {
        let cache = MemoryCache::new();
        cache.set_raw("geo:state:1:2", "x", None).unwrap();
        cache.set_raw("geo:state:1:3", "y", None).unwrap();
        cache.set_raw("geo:defs:1", "z", None).unwrap();
        cache.delete_prefix("geo:state:1:").unwrap();
        assert_eq!(cache.get_raw("geo:state:1:2").unwrap(), None);
        assert_eq!(cache.get_raw("geo:state:1:3").unwrap(), None);
        assert!(cache.get_raw("geo:defs:1").unwrap().is_some());
    }

    #[test]
    fn typed_helpers_roundtrip_json() {
        let cache = MemoryCache::new();
        set_json(&cache, "pt", &(1.5f64, -2.5f64), None).unwrap();
        let got: Option<(f64, f64)> = get_json(&cache, "pt").unwrap();
        assert_eq!(got, Some((1.5, -2.5)));
    }
}
