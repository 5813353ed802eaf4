use crate::engine::Notifier;
use crate::engine::geofence::GeofenceService;
use crate::engine::settings::SettingsService;
use crate::util::logging::{debug, warn};
use anyhow::Result;
use chrono::Utc;
use hearthmap_common::cache::CacheHandle;
use hearthmap_common::config::AppConfig;
use hearthmap_common::keys;
use hearthmap_core::model::{AlertKind, QueuedFix, TriggeredAlert};
use hearthmap_storage::{NewEvent, Store};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LEASE_NAME: &str = "geofence-queue";

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    pub time_budget: Duration,
    pub retry_window: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            time_budget: Duration::from_secs(55),
            retry_window: Duration::from_secs(3600),
        }
    }
}

impl From<&AppConfig> for ProcessorConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            batch_size: cfg.processor_batch_size.max(1),
            time_budget: Duration::from_secs(cfg.processor_time_budget_secs),
            retry_window: Duration::from_secs(cfg.processor_retry_window_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Another run held the lease; nothing was done.
    pub skipped: bool,
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// One scheduled invocation of the queue processor. A cache lease keeps
/// overlapping invocations no-ops; the run drains bounded batches until the
/// queue is empty or the time budget is spent, then does queue housekeeping.
pub fn run_once(
    store: &Arc<dyn Store>,
    cache: &Arc<dyn CacheHandle>,
    notifier: &Arc<dyn Notifier>,
    cfg: &ProcessorConfig,
) -> Result<RunSummary> {
    let lease_key = keys::job_lease(LEASE_NAME);
    let run_id = crate::util::run_id::new_run_id();
    match cache.set_if_absent(&lease_key, &run_id, keys::JOB_LEASE_TTL) {
        Ok(true) => {}
        Ok(false) => {
            debug!("queue processor lease held elsewhere; skipping run");
            return Ok(RunSummary {
                skipped: true,
                ..Default::default()
            });
        }
        // Losing the cache loses mutual exclusion, not correctness: state
        // flips are idempotent, so run anyway.
        Err(e) => warn!("processor lease unavailable, running unlocked: {:#}", e),
    }

    let result = drain(store, cache, notifier, cfg);
    if let Err(e) = cache.delete(&lease_key) {
        debug!("failed to release processor lease: {:#}", e);
    }
    result
}

fn drain(
    store: &Arc<dyn Store>,
    cache: &Arc<dyn CacheHandle>,
    notifier: &Arc<dyn Notifier>,
    cfg: &ProcessorConfig,
) -> Result<RunSummary> {
    let started = Instant::now();
    let mut summary = RunSummary::default();
    // Failed items stay claimable inside the retry window, so without this a
    // persistently failing item would spin for the whole time budget.
    let mut attempted: HashSet<i64> = HashSet::new();

    let settings = SettingsService::new(Arc::clone(store), Arc::clone(cache));
    let geofences = GeofenceService::new(
        Arc::clone(store),
        Arc::clone(cache),
        Arc::clone(notifier),
    );

    'outer: while started.elapsed() < cfg.time_budget {
        let now = Utc::now();
        let batch = store.claim_queue_batch(cfg.batch_size, now, cfg.retry_window)?;
        let fresh: Vec<QueuedFix> = batch
            .into_iter()
            .filter(|item| !attempted.contains(&item.id))
            .collect();
        if fresh.is_empty() {
            break;
        }

        for item in fresh {
            if started.elapsed() >= cfg.time_budget {
                break 'outer;
            }
            attempted.insert(item.id);
            summary.claimed += 1;
            match process_item(store.as_ref(), cache.as_ref(), notifier.as_ref(), &settings, &geofences, &item) {
                Ok(()) => {
                    store.mark_queue_processed(item.id, Utc::now())?;
                    summary.processed += 1;
                }
                Err(e) => {
                    warn!("queue item {} failed: {:#}", item.id, e);
                    store.mark_queue_failed(item.id, Utc::now(), &format!("{e:#}"))?;
                    summary.failed += 1;
                }
            }
        }
    }

    summary.pruned = store.prune_queue(Utc::now())?;

    if let Ok(depth) = store.queue_depth() {
        hearthmap_storage::publish_queue_depth(depth);
    }
    hearthmap_storage::set_last_run(Utc::now());

    Ok(summary)
}

/// Low-battery detection (cooldown-suppressed) followed by zone transition
/// detection for one parked fix.
fn process_item(
    store: &dyn Store,
    cache: &dyn CacheHandle,
    notifier: &dyn Notifier,
    settings: &SettingsService,
    geofences: &GeofenceService,
    item: &QueuedFix,
) -> Result<()> {
    let family_settings = settings.family(item.family_id)?;

    if let Some(pct) = item.battery {
        if pct < family_settings.low_battery_pct {
            let cooldown_key = keys::alert_cooldown("battery", item.user_id);
            // Cooldown loss may re-alert early; that is the permissive side.
            let fresh = cache
                .set_if_absent(&cooldown_key, "1", keys::ALERT_COOLDOWN_TTL)
                .unwrap_or(true);
            if fresh {
                let alert = TriggeredAlert {
                    rule_id: None,
                    name: "Low battery".to_string(),
                    kind: AlertKind::Battery,
                };
                notifier.alert(item.user_id, item.family_id, &alert);
                store.append_event(&NewEvent {
                    family_id: item.family_id,
                    user_id: Some(item.user_id),
                    kind: "alert.battery".to_string(),
                    payload: Some(
                        serde_json::json!({ "battery": pct, "floor": family_settings.low_battery_pct })
                            .to_string(),
                    ),
                })?;
            }
        }
    }

    geofences.evaluate(item.user_id, item.family_id, item.lat, item.lng, item.recorded_at)?;
    Ok(())
}
