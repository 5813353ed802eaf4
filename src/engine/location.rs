use crate::util::logging::debug;
use chrono::{DateTime, Utc};
use hearthmap_common::cache::{self, CacheHandle};
use hearthmap_common::keys;
use hearthmap_core::error::EngineError;
use hearthmap_core::model::{CurrentLocation, HistoryPoint, LocationFix};
use hearthmap_core::quality;
use hearthmap_storage::{NewHistoryPoint, Store};
use std::sync::Arc;

/// Reads prefer the cache and repair it from the store on a miss. Writes are
/// owned by the ingest path: promote moves the position, touch refreshes
/// liveness only, and nothing else in the system mutates a current record.
pub struct LocationService {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheHandle>,
}

impl LocationService {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn CacheHandle>) -> Self {
        Self { store, cache }
    }

    pub fn current_for(&self, user_id: i64) -> Result<Option<CurrentLocation>, EngineError> {
        let key = keys::current_location(user_id);
        match cache::get_json::<CurrentLocation>(self.cache.as_ref(), &key) {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => {}
            Err(e) => debug!("current-location cache read failed: {:#}", e),
        }

        let record = self
            .store
            .fetch_current(user_id)
            .map_err(EngineError::persistence)?;
        if let Some(record) = &record {
            self.cache_current(record);
        }
        Ok(record)
    }

    pub fn family_snapshot(&self, family_id: i64) -> Result<Vec<CurrentLocation>, EngineError> {
        let key = keys::family_snapshot(family_id);
        match cache::get_json::<Vec<CurrentLocation>>(self.cache.as_ref(), &key) {
            Ok(Some(records)) => return Ok(records),
            Ok(None) => {}
            Err(e) => debug!("family-snapshot cache read failed: {:#}", e),
        }

        let records = self
            .store
            .fetch_family_current(family_id)
            .map_err(EngineError::persistence)?;
        if let Err(e) = cache::set_json(
            self.cache.as_ref(),
            &key,
            &records,
            Some(keys::FAMILY_SNAPSHOT_TTL),
        ) {
            debug!("family-snapshot cache write failed: {:#}", e);
        }
        Ok(records)
    }

    pub fn history(
        &self,
        user_id: i64,
        family_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, EngineError> {
        self.store
            .fetch_history(user_id, family_id, from, to, limit)
            .map_err(EngineError::persistence)
    }

    /// Full upsert: the fix becomes the authoritative position.
    pub(crate) fn promote(
        &self,
        user_id: i64,
        family_id: i64,
        fix: &LocationFix,
        quality_score: i32,
        now: DateTime<Utc>,
    ) -> Result<CurrentLocation, EngineError> {
        let record = CurrentLocation {
            user_id,
            family_id,
            lat: fix.lat,
            lng: fix.lng,
            accuracy_m: fix.accuracy_m,
            speed: fix.speed,
            heading: fix.heading,
            battery: fix.battery,
            is_moving: fix.is_moving,
            quality_score,
            source: quality::classify_source(fix.accuracy_m),
            updated_at: now,
        };
        self.store
            .upsert_current(&record)
            .map_err(EngineError::persistence)?;
        // Cache refresh happens after the store write; a crash in between
        // just leaves a stale entry until its TTL runs out.
        self.cache_current(&record);
        self.invalidate_snapshot(family_id);
        Ok(record)
    }

    /// Heartbeat: only liveness fields move, the position stays put.
    pub(crate) fn touch(
        &self,
        user_id: i64,
        family_id: i64,
        fix: &LocationFix,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let touched = self
            .store
            .touch_current(user_id, fix.battery, fix.is_moving, now)
            .map_err(EngineError::persistence)?;
        if touched {
            // Rewrite the cached record with the refreshed liveness fields
            // rather than re-reading the store.
            let key = keys::current_location(user_id);
            match cache::get_json::<CurrentLocation>(self.cache.as_ref(), &key) {
                Ok(Some(mut record)) => {
                    record.battery = fix.battery;
                    record.is_moving = fix.is_moving;
                    record.updated_at = now;
                    self.cache_current(&record);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("current-location cache read failed on touch: {:#}", e);
                    let _ = self.cache.delete(&key);
                }
            }
            self.invalidate_snapshot(family_id);
        }
        Ok(touched)
    }

    pub(crate) fn append_history(
        &self,
        user_id: i64,
        family_id: i64,
        fix: &LocationFix,
    ) -> Result<i64, EngineError> {
        self.store
            .append_history(&NewHistoryPoint {
                user_id,
                family_id,
                lat: fix.lat,
                lng: fix.lng,
                accuracy_m: fix.accuracy_m,
                speed: fix.speed,
                battery: fix.battery,
                recorded_at: fix.recorded_at,
            })
            .map_err(EngineError::persistence)
    }

    fn cache_current(&self, record: &CurrentLocation) {
        if let Err(e) = cache::set_json(
            self.cache.as_ref(),
            &keys::current_location(record.user_id),
            record,
            Some(keys::CURRENT_LOCATION_TTL),
        ) {
            debug!("current-location cache write failed: {:#}", e);
        }
    }

    fn invalidate_snapshot(&self, family_id: i64) {
        if let Err(e) = self.cache.delete(&keys::family_snapshot(family_id)) {
            debug!("family-snapshot invalidation failed: {:#}", e);
        }
    }
}
