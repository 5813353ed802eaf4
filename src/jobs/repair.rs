use crate::util::logging::{debug, warn};
use anyhow::Result;
use chrono::Utc;
use hearthmap_common::cache::CacheHandle;
use hearthmap_common::keys;
use hearthmap_core::geofence::zone_contains;
use hearthmap_core::model::GeofenceState;
use hearthmap_storage::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub pairs_checked: usize,
    pub states_fixed: usize,
}

/// Offline repair: recomputes `is_inside` for every (active zone, sharing
/// member) pair from the member's current location, rewriting drifted rows
/// and invalidating their cache entries. A missing state row counts as
/// outside, so rows are only created when the member is actually inside.
pub fn recompute_geofence_states(store: &dyn Store, cache: &dyn CacheHandle) -> Result<RepairSummary> {
    let mut summary = RepairSummary::default();
    let now = Utc::now();

    for family_id in store.list_family_ids()? {
        let fences = store.list_active_geofences(family_id)?;
        if fences.is_empty() {
            continue;
        }

        for user_id in store.list_sharing_members(family_id)? {
            let Some(current) = store.fetch_current(user_id)? else {
                continue;
            };

            for fence in &fences {
                summary.pairs_checked += 1;
                let should_be_inside = zone_contains(fence, current.lat, current.lng);
                let state = match store.fetch_geofence_state(fence.id, user_id) {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(
                            "repair: failed to read state for fence {} user {}: {:#}",
                            fence.id, user_id, e
                        );
                        continue;
                    }
                };
                let recorded_inside = state.as_ref().map(|s| s.is_inside).unwrap_or(false);
                if recorded_inside == should_be_inside {
                    continue;
                }

                let mut corrected = state.unwrap_or(GeofenceState {
                    fence_id: fence.id,
                    user_id,
                    is_inside: false,
                    entered_at: None,
                    exited_at: None,
                });
                corrected.is_inside = should_be_inside;
                if should_be_inside {
                    corrected.entered_at = Some(now);
                } else {
                    corrected.exited_at = Some(now);
                }

                if let Err(e) = store.upsert_geofence_state(&corrected) {
                    warn!(
                        "repair: failed to rewrite state for fence {} user {}: {:#}",
                        fence.id, user_id, e
                    );
                    continue;
                }
                if let Err(e) = cache.delete(&keys::geofence_state(fence.id, user_id)) {
                    debug!("repair: cache invalidation failed: {:#}", e);
                }
                summary.states_fixed += 1;
            }
        }
    }

    Ok(summary)
}
