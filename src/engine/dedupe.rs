use crate::util::logging::debug;
use chrono::{DateTime, Utc};
use hearthmap_common::cache::{self, CacheHandle};
use hearthmap_common::keys;
use hearthmap_core::geo;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Distance is always measured from the last *recorded* point, not from
/// every prior fix: a slow drift past the threshold still registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowPoint {
    lat: f64,
    lng: f64,
    at: DateTime<Utc>,
}

/// Advisory near-duplicate suppression over a short-TTL cache window. It
/// never gates the quality gate's writes, only the expensive downstream zone
/// and alert work; losing the window degrades to "never a duplicate".
pub struct DedupeFilter {
    cache: Arc<dyn CacheHandle>,
    min_distance_m: f64,
}

impl DedupeFilter {
    pub fn new(cache: Arc<dyn CacheHandle>, min_distance_m: f64) -> Self {
        Self {
            cache,
            min_distance_m,
        }
    }

    /// Returns true when the fix is a near-duplicate of the cached point.
    /// Duplicates leave the cached point untouched.
    pub fn check_and_update(&self, user_id: i64, lat: f64, lng: f64, now: DateTime<Utc>) -> bool {
        let key = keys::dedupe_window(user_id);

        let previous = match cache::get_json::<WindowPoint>(self.cache.as_ref(), &key) {
            Ok(previous) => previous,
            Err(e) => {
                debug!("dedupe window read failed, treating as fresh: {:#}", e);
                None
            }
        };

        if let Some(previous) = previous {
            let dist_m = geo::haversine_m(previous.lat, previous.lng, lat, lng);
            if dist_m < self.min_distance_m {
                return true;
            }
        }

        let point = WindowPoint { lat, lng, at: now };
        if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &point, Some(keys::DEDUPE_TTL)) {
            debug!("dedupe window write failed: {:#}", e);
        }
        false
    }
}
