pub mod alerts;
pub mod dedupe;
pub mod geofence;
pub mod location;
pub mod rate_limit;
pub mod session;
pub mod settings;

use crate::util::logging::{debug, warn};
use chrono::Utc;
use hearthmap_common::cache::CacheHandle;
use hearthmap_common::config::AppConfig;
use hearthmap_core::error::EngineError;
use hearthmap_core::model::{
    CurrentLocation, HistoryPoint, LocationFix, TriggeredAlert, ZoneEvent,
};
use hearthmap_core::quality::{self, QualityDecision};
use hearthmap_storage::{NewQueuedFix, Store};
use std::sync::Arc;

use self::alerts::AlertsService;
use self::dedupe::DedupeFilter;
use self::geofence::GeofenceService;
use self::location::LocationService;
use self::rate_limit::RateLimiter;
use self::session::SessionGate;
use self::settings::SettingsService;

/// Rate-limit action name for post-write fix processing.
pub const ACTION_PROCESS_FIX: &str = "process_fix";

/// Sink for the descriptors the engine hands to the (external) notification
/// delivery collaborator.
pub trait Notifier: Send + Sync {
    fn zone_event(&self, event: &ZoneEvent);
    fn alert(&self, user_id: i64, family_id: i64, alert: &TriggeredAlert);
}

/// Default sink: log and move on. Real deployments inject a push-delivery
/// implementation here.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn zone_event(&self, event: &ZoneEvent) {
        log::info!(
            "zone {} for user {} fence '{}' ({})",
            event.transition.label(),
            event.user_id,
            event.fence_name,
            event.fence_id
        );
    }

    fn alert(&self, user_id: i64, family_id: i64, alert: &TriggeredAlert) {
        log::info!(
            "alert {} '{}' for user {} in family {}",
            alert.kind.label(),
            alert.name,
            user_id,
            family_id
        );
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub rate_limit_per_minute: u32,
    pub dedupe_min_distance_m: f64,
    pub inline_processing: bool,
    pub session_max_duration_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 10,
            dedupe_min_distance_m: 10.0,
            inline_processing: false,
            session_max_duration_secs: 2 * 3600,
        }
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            rate_limit_per_minute: cfg.rate_limit_per_minute,
            dedupe_min_distance_m: cfg.dedupe_min_distance_m,
            inline_processing: cfg.inline_processing,
            session_max_duration_secs: cfg.session_max_duration_secs,
        }
    }
}

/// What happened to one submitted fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixOutcome {
    pub decision: QualityDecision,
    pub quality_score: i32,
    /// Within dedupe distance of the last considered point; downstream
    /// processing was skipped.
    pub duplicate: bool,
    /// The per-user processing budget for this minute was spent.
    pub throttled: bool,
    /// Parked on the durable queue for the background processor.
    pub queued: bool,
}

/// The ingest engine: everything a fix submission touches, wired around one
/// injected store, cache, and notifier.
pub struct IngestEngine {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheHandle>,
    notifier: Arc<dyn Notifier>,
    cfg: EngineConfig,
    locations: LocationService,
    dedupe: DedupeFilter,
    limiter: RateLimiter,
    geofences: GeofenceService,
    alerts: AlertsService,
    sessions: SessionGate,
    settings: SettingsService,
}

impl IngestEngine {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn CacheHandle>,
        notifier: Arc<dyn Notifier>,
        cfg: EngineConfig,
    ) -> Self {
        let locations = LocationService::new(Arc::clone(&store), Arc::clone(&cache));
        let dedupe = DedupeFilter::new(Arc::clone(&cache), cfg.dedupe_min_distance_m);
        let limiter = RateLimiter::new(Arc::clone(&cache));
        let geofences = GeofenceService::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&notifier),
        );
        let alerts = AlertsService::new(Arc::clone(&store), Arc::clone(&cache));
        let sessions = SessionGate::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            cfg.session_max_duration_secs,
        );
        let settings = SettingsService::new(Arc::clone(&store), Arc::clone(&cache));
        Self {
            store,
            cache,
            notifier,
            cfg,
            locations,
            dedupe,
            limiter,
            geofences,
            alerts,
            sessions,
            settings,
        }
    }

    /// Ingests one authenticated fix. The quality gate decides what gets
    /// written; dedupe and the rate limiter only gate the downstream zone and
    /// alert work, never the write itself.
    pub fn submit_fix(
        &self,
        user_id: i64,
        family_id: i64,
        fix: &LocationFix,
    ) -> Result<FixOutcome, EngineError> {
        fix.validate()?;
        let now = Utc::now();

        let last = self.locations.current_for(user_id)?;
        let quality_score = quality::compute_score(fix);
        let decision = quality::decide(fix, last.as_ref(), now);

        match decision {
            QualityDecision::Reject => {
                debug!(
                    "rejected fix for user {} (score {}): no write",
                    user_id, quality_score
                );
                return Ok(FixOutcome {
                    decision,
                    quality_score,
                    duplicate: false,
                    throttled: false,
                    queued: false,
                });
            }
            QualityDecision::Touch => {
                self.locations.touch(user_id, family_id, fix, now)?;
            }
            QualityDecision::Promote => {
                self.locations
                    .promote(user_id, family_id, fix, quality_score, now)?;
            }
        }

        // Advisory gates: losing either cache entry only means doing more
        // work, never skipping a write that already happened above.
        let duplicate = self.dedupe.check_and_update(user_id, fix.lat, fix.lng, now);
        let throttled = !self.limiter.allow(
            ACTION_PROCESS_FIX,
            user_id,
            self.cfg.rate_limit_per_minute,
        );

        let mut queued = false;
        if !duplicate {
            if decision == QualityDecision::Promote {
                self.locations.append_history(user_id, family_id, fix)?;
            }
            if !throttled {
                if self.cfg.inline_processing {
                    self.process_inline(user_id, family_id, fix, now);
                } else {
                    queued = self.enqueue(user_id, family_id, fix, now);
                }
            }
        }

        Ok(FixOutcome {
            decision,
            quality_score,
            duplicate,
            throttled,
            queued,
        })
    }

    /// Zone and alert evaluation on the write path. Best-effort: an accepted
    /// fix is never failed retroactively by downstream trouble.
    fn process_inline(
        &self,
        user_id: i64,
        family_id: i64,
        fix: &LocationFix,
        now: chrono::DateTime<Utc>,
    ) {
        if let Err(e) = self
            .geofences
            .evaluate(user_id, family_id, fix.lat, fix.lng, now)
        {
            warn!("inline geofence evaluation failed for user {}: {}", user_id, e);
        }
        match self.alerts.evaluate(user_id, family_id, fix) {
            Ok(triggered) => {
                for alert in &triggered {
                    self.notifier.alert(user_id, family_id, alert);
                    if let Err(e) = self.store.append_event(&hearthmap_storage::NewEvent {
                        family_id,
                        user_id: Some(user_id),
                        kind: format!("alert.{}", alert.kind.label()),
                        payload: serde_json::to_string(alert).ok(),
                    }) {
                        warn!("failed to record alert event: {:#}", e);
                    }
                }
            }
            Err(e) => warn!("inline alert evaluation failed for user {}: {}", user_id, e),
        }
    }

    fn enqueue(
        &self,
        user_id: i64,
        family_id: i64,
        fix: &LocationFix,
        now: chrono::DateTime<Utc>,
    ) -> bool {
        let item = NewQueuedFix {
            user_id,
            family_id,
            lat: fix.lat,
            lng: fix.lng,
            speed: fix.speed,
            battery: fix.battery,
            is_moving: fix.is_moving,
            recorded_at: fix.recorded_at,
        };
        match self.store.enqueue_fix(&item, now) {
            Ok(_) => true,
            Err(e) => {
                warn!("failed to enqueue fix for user {}: {:#}", user_id, e);
                false
            }
        }
    }

    // Read surface for the (external) HTTP layer.

    pub fn current_for(&self, user_id: i64) -> Result<Option<CurrentLocation>, EngineError> {
        self.locations.current_for(user_id)
    }

    pub fn family_snapshot(&self, family_id: i64) -> Result<Vec<CurrentLocation>, EngineError> {
        self.locations.family_snapshot(family_id)
    }

    pub fn history(
        &self,
        user_id: i64,
        family_id: i64,
        from: chrono::DateTime<Utc>,
        to: chrono::DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, EngineError> {
        self.locations.history(user_id, family_id, from, to, limit)
    }

    pub fn sessions(&self) -> &SessionGate {
        &self.sessions
    }

    pub fn geofences(&self) -> &GeofenceService {
        &self.geofences
    }

    pub fn alerts(&self) -> &AlertsService {
        &self.alerts
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<dyn CacheHandle> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
