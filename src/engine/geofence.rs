use crate::engine::Notifier;
use crate::util::logging::{debug, warn};
use anyhow::Result;
use chrono::{DateTime, Utc};
use hearthmap_common::cache::{self, CacheHandle};
use hearthmap_common::keys;
use hearthmap_core::error::EngineError;
use hearthmap_core::geofence::{transition_for, zone_contains};
use hearthmap_core::model::{Geofence, GeofenceState, ZoneEvent, ZoneTransition};
use hearthmap_storage::{NewEvent, Store};
use std::sync::Arc;

/// Evaluates fixes against a family's zones and emits enter/exit exactly once
/// per membership flip. Zones are independent: a user can be inside several
/// overlapping ones at once.
pub struct GeofenceService {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheHandle>,
    notifier: Arc<dyn Notifier>,
}

impl GeofenceService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn CacheHandle>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            cache,
            notifier,
        }
    }

    /// Runs every active zone for the family against one position. A zone
    /// whose evaluation fails is logged and skipped; the rest still run.
    pub fn evaluate(
        &self,
        user_id: i64,
        family_id: i64,
        lat: f64,
        lng: f64,
        at: DateTime<Utc>,
    ) -> Result<Vec<ZoneEvent>, EngineError> {
        let fences = self.family_fences(family_id)?;
        let mut emitted = Vec::new();
        for fence in &fences {
            match self.evaluate_fence(fence, user_id, family_id, lat, lng, at) {
                Ok(Some(event)) => {
                    self.notifier.zone_event(&event);
                    emitted.push(event);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "geofence {} ('{}') evaluation failed for user {}: {:#}",
                        fence.id, fence.name, user_id, e
                    );
                }
            }
        }
        Ok(emitted)
    }

    fn family_fences(&self, family_id: i64) -> Result<Vec<Geofence>, EngineError> {
        let key = keys::geofence_defs(family_id);
        match cache::get_json::<Vec<Geofence>>(self.cache.as_ref(), &key) {
            Ok(Some(fences)) => return Ok(fences),
            Ok(None) => {}
            Err(e) => debug!("geofence definitions cache read failed: {:#}", e),
        }

        let fences = self
            .store
            .list_active_geofences(family_id)
            .map_err(EngineError::persistence)?;
        if let Err(e) = cache::set_json(
            self.cache.as_ref(),
            &key,
            &fences,
            Some(keys::GEOFENCE_DEFS_TTL),
        ) {
            debug!("geofence definitions cache write failed: {:#}", e);
        }
        Ok(fences)
    }

    fn state_for(&self, fence_id: i64, user_id: i64) -> Result<Option<GeofenceState>> {
        let key = keys::geofence_state(fence_id, user_id);
        match cache::get_json::<GeofenceState>(self.cache.as_ref(), &key) {
            Ok(Some(state)) => return Ok(Some(state)),
            Ok(None) => {}
            Err(e) => debug!("geofence state cache read failed: {:#}", e),
        }

        let state = self.store.fetch_geofence_state(fence_id, user_id)?;
        if let Some(state) = &state {
            if let Err(e) =
                cache::set_json(self.cache.as_ref(), &key, state, Some(keys::GEOFENCE_STATE_TTL))
            {
                debug!("geofence state cache write failed: {:#}", e);
            }
        }
        Ok(state)
    }

    /// One zone, one user, one position. Persists the flip and stamps the
    /// matching timestamp; returns an event only when the zone's notify flag
    /// for that direction is set. No flip, no write.
    fn evaluate_fence(
        &self,
        fence: &Geofence,
        user_id: i64,
        family_id: i64,
        lat: f64,
        lng: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<ZoneEvent>> {
        let previous = self.state_for(fence.id, user_id)?;
        let was_inside = previous.as_ref().map(|s| s.is_inside).unwrap_or(false);
        let now_inside = zone_contains(fence, lat, lng);

        let Some(transition) = transition_for(was_inside, now_inside) else {
            return Ok(None);
        };

        let mut state = previous.unwrap_or(GeofenceState {
            fence_id: fence.id,
            user_id,
            is_inside: false,
            entered_at: None,
            exited_at: None,
        });
        state.is_inside = now_inside;
        match transition {
            ZoneTransition::Enter => state.entered_at = Some(at),
            ZoneTransition::Exit => state.exited_at = Some(at),
        }

        self.store.upsert_geofence_state(&state)?;
        if let Err(e) = cache::set_json(
            self.cache.as_ref(),
            &keys::geofence_state(fence.id, user_id),
            &state,
            Some(keys::GEOFENCE_STATE_TTL),
        ) {
            debug!("geofence state cache write failed: {:#}", e);
        }

        let payload = serde_json::json!({
            "fence_id": fence.id,
            "fence_name": fence.name,
            "transition": transition.label(),
        })
        .to_string();
        self.store.append_event(&NewEvent {
            family_id,
            user_id: Some(user_id),
            kind: format!("geofence.{}", transition.label()),
            payload: Some(payload),
        })?;

        let notify = match transition {
            ZoneTransition::Enter => fence.notify_enter,
            ZoneTransition::Exit => fence.notify_exit,
        };
        Ok(notify.then(|| ZoneEvent {
            fence_id: fence.id,
            fence_name: fence.name.clone(),
            user_id,
            family_id,
            transition,
            at,
        }))
    }
}
