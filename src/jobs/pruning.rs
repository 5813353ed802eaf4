use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use hearthmap_common::config::AppConfig;
use hearthmap_storage::Store;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PruneConfig {
    pub default_retention_days: u32,
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            default_retention_days: 90,
            batch_size: 500,
            batch_pause: Duration::from_millis(50),
        }
    }
}

impl From<&AppConfig> for PruneConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            default_retention_days: cfg.default_retention_days,
            batch_size: cfg.prune_batch_size.max(1),
            batch_pause: Duration::from_millis(cfg.prune_batch_pause_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub families: usize,
    pub history_rows: usize,
    pub event_rows: usize,
}

/// Applies each family's retention window to history and audit events.
/// Deletes run in fixed-size batches with a pause in between so the store
/// never holds a long delete lock.
pub fn run_retention_prune(store: &dyn Store, cfg: &PruneConfig) -> Result<PruneSummary> {
    let mut summary = PruneSummary::default();
    let now = Utc::now();

    for family_id in store.list_family_ids()? {
        summary.families += 1;
        let retention_days = store
            .fetch_settings(family_id)?
            .map(|s| s.retention_days)
            .unwrap_or(cfg.default_retention_days);
        let cutoff = now - ChronoDuration::days(i64::from(retention_days));

        loop {
            let deleted = store.prune_history_before(family_id, cutoff, cfg.batch_size)?;
            summary.history_rows += deleted;
            if deleted < cfg.batch_size {
                break;
            }
            std::thread::sleep(cfg.batch_pause);
        }

        loop {
            let deleted = store.prune_events_before(family_id, cutoff, cfg.batch_size)?;
            summary.event_rows += deleted;
            if deleted < cfg.batch_size {
                break;
            }
            std::thread::sleep(cfg.batch_pause);
        }
    }

    Ok(summary)
}
