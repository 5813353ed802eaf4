use crate::util::logging::debug;
use chrono::{Duration, Utc};
use hearthmap_common::cache::CacheHandle;
use hearthmap_common::keys;
use hearthmap_core::error::EngineError;
use hearthmap_core::model::{SessionStatus, TrackingSession};
use hearthmap_storage::{NewSession, Store};
use std::sync::Arc;

const LIVE: &str = "1";
const NOT_LIVE: &str = "0";

/// Tracks whether a user has an active live-tracking session. Liveness reads
/// are cache-first with a store fallback that repopulates the flag; the
/// one-active-session-per-user invariant is enforced in `start`, not by a
/// store constraint.
pub struct SessionGate {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheHandle>,
    max_duration_secs: u64,
}

impl SessionGate {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn CacheHandle>, max_duration_secs: u64) -> Self {
        Self {
            store,
            cache,
            max_duration_secs,
        }
    }

    pub fn is_active(&self, user_id: i64) -> Result<bool, EngineError> {
        let key = keys::session_live(user_id);
        match self.cache.get_raw(&key) {
            Ok(Some(flag)) => return Ok(flag == LIVE),
            Ok(None) => {}
            Err(e) => debug!("session liveness cache read failed: {:#}", e),
        }

        let active = self
            .store
            .active_session(user_id, Utc::now())
            .map_err(EngineError::persistence)?
            .is_some();
        self.set_flag(user_id, active);
        Ok(active)
    }

    /// Extends the session's liveness window and records the keepalive.
    /// Returns false when there is no active session to keep alive.
    pub fn keepalive(&self, user_id: i64) -> Result<bool, EngineError> {
        let alive = self
            .store
            .touch_keepalive(user_id, Utc::now())
            .map_err(EngineError::persistence)?;
        if alive {
            self.set_flag(user_id, true);
        }
        Ok(alive)
    }

    /// Starts a live session, implicitly stopping any prior active one for
    /// this user. Expiry is bounded regardless of keepalives.
    pub fn start(
        &self,
        user_id: i64,
        family_id: i64,
        mode: &str,
        interval_secs: u32,
    ) -> Result<TrackingSession, EngineError> {
        let now = Utc::now();
        self.store
            .stop_active_sessions(user_id, now)
            .map_err(EngineError::persistence)?;

        let expires_at = now + Duration::seconds(self.max_duration_secs as i64);
        let session = NewSession {
            user_id,
            family_id,
            mode: mode.to_string(),
            interval_secs,
            started_at: now,
            expires_at,
        };
        let id = self
            .store
            .insert_session(&session)
            .map_err(EngineError::persistence)?;
        self.set_flag(user_id, true);

        Ok(TrackingSession {
            id,
            user_id,
            family_id,
            status: SessionStatus::Active,
            mode: session.mode,
            interval_secs,
            started_at: now,
            expires_at,
            last_keepalive: None,
        })
    }

    pub fn stop(&self, user_id: i64) -> Result<usize, EngineError> {
        let stopped = self
            .store
            .stop_active_sessions(user_id, Utc::now())
            .map_err(EngineError::persistence)?;
        self.set_flag(user_id, false);
        Ok(stopped)
    }

    pub fn stop_all(&self, family_id: i64) -> Result<Vec<i64>, EngineError> {
        let users = self
            .store
            .stop_family_sessions(family_id, Utc::now())
            .map_err(EngineError::persistence)?;
        for user_id in &users {
            self.set_flag(*user_id, false);
        }
        Ok(users)
    }

    fn set_flag(&self, user_id: i64, active: bool) {
        let value = if active { LIVE } else { NOT_LIVE };
        if let Err(e) = self.cache.set_raw(
            &keys::session_live(user_id),
            value,
            Some(keys::SESSION_LIVE_TTL),
        ) {
            debug!("session liveness cache write failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearthmap_common::cache::MemoryCache;
    use hearthmap_storage::sqlite3::SqliteStore;

    fn gate() -> (SessionGate, Arc<MemoryCache>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = Arc::new(MemoryCache::new());
        let gate = SessionGate::new(store, cache.clone() as Arc<dyn CacheHandle>, 7200);
        (gate, cache)
    }

    #[test]
    fn start_enforces_the_singleton_invariant() {
        let (gate, _cache) = gate();
        let first = gate.start(1, 1, "precise", 15).unwrap();
        let second = gate.start(1, 1, "passive", 60).unwrap();
        assert_ne!(first.id, second.id);
        assert!(gate.is_active(1).unwrap());
        // Only the second session can still be stopped.
        assert_eq!(gate.stop(1).unwrap(), 1);
        assert!(!gate.is_active(1).unwrap());
    }

    #[test]
    fn liveness_falls_back_to_the_store_and_repairs_the_cache() {
        let (gate, cache) = gate();
        gate.start(1, 1, "precise", 15).unwrap();

        // Simulate cache eviction; the store still knows.
        cache.delete(&keys::session_live(1)).unwrap();
        assert!(gate.is_active(1).unwrap());
        // The flag was repopulated on the way out.
        assert_eq!(cache.get_raw(&keys::session_live(1)).unwrap().as_deref(), Some(LIVE));
    }

    #[test]
    fn keepalive_requires_an_active_session() {
        let (gate, _cache) = gate();
        assert!(!gate.keepalive(1).unwrap());
        gate.start(1, 1, "precise", 15).unwrap();
        assert!(gate.keepalive(1).unwrap());
    }

    #[test]
    fn stop_all_clears_every_family_member() {
        let (gate, _cache) = gate();
        gate.start(1, 1, "precise", 15).unwrap();
        gate.start(2, 1, "precise", 15).unwrap();
        let mut users = gate.stop_all(1).unwrap();
        users.sort_unstable();
        assert_eq!(users, vec![1, 2]);
        assert!(!gate.is_active(1).unwrap());
        assert!(!gate.is_active(2).unwrap());
    }
}
