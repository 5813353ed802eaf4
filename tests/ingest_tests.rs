use chrono::Utc;
use hearthmap::engine::{EngineConfig, FixOutcome, IngestEngine, Notifier};
use hearthmap::storage::Store;
use hearthmap::storage::sqlite3::SqliteStore;
use hearthmap_common::cache::{CacheHandle, MemoryCache};
use hearthmap_core::error::EngineError;
use hearthmap_core::model::{LocationFix, TriggeredAlert, ZoneEvent};
use hearthmap_core::quality::QualityDecision;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingNotifier {
    zone_events: Mutex<Vec<ZoneEvent>>,
    alerts: Mutex<Vec<(i64, i64, TriggeredAlert)>>,
}

impl Notifier for RecordingNotifier {
    fn zone_event(&self, event: &ZoneEvent) {
        self.zone_events.lock().unwrap().push(event.clone());
    }

    fn alert(&self, user_id: i64, family_id: i64, alert: &TriggeredAlert) {
        self.alerts
            .lock()
            .unwrap()
            .push((user_id, family_id, alert.clone()));
    }
}

struct Harness {
    engine: IngestEngine,
    store: Arc<SqliteStore>,
    #[allow(dead_code)]
    notifier: Arc<RecordingNotifier>,
}

fn harness(cfg: EngineConfig) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = Arc::new(MemoryCache::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = IngestEngine::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&cache) as Arc<dyn CacheHandle>,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        cfg,
    );
    Harness {
        engine,
        store,
        notifier,
    }
}

fn mk_fix(lat: f64, lng: f64) -> LocationFix {
    LocationFix {
        lat,
        lng,
        accuracy_m: Some(15.0),
        speed: Some(40.0 / 3.6),
        heading: Some(180.0),
        altitude: None,
        battery: Some(80.0),
        is_moving: true,
        recorded_at: Utc::now(),
    }
}

#[test]
fn clean_fix_promotes_and_writes_current_history_and_queue() {
    let h = harness(EngineConfig::default());
    let outcome = h.engine.submit_fix(1, 1, &mk_fix(48.0, 2.0)).unwrap();

    assert_eq!(outcome.decision, QualityDecision::Promote);
    assert!(!outcome.duplicate);
    assert!(!outcome.throttled);
    assert!(outcome.queued);
    assert!(outcome.quality_score >= 90);

    let current = h.store.fetch_current(1).unwrap().expect("current exists");
    assert_eq!(current.lat, 48.0);
    assert_eq!(current.lng, 2.0);
    assert_eq!(current.family_id, 1);

    let history = h
        .engine
        .history(1, 1, Utc::now() - chrono::Duration::hours(1), Utc::now(), 10)
        .unwrap();
    assert_eq!(history.len(), 1);

    assert_eq!(h.store.queue_depth().unwrap().pending, 1);
}

#[test]
fn very_noisy_fix_touches_without_moving_the_position() {
    let h = harness(EngineConfig::default());
    h.engine.submit_fix(1, 1, &mk_fix(48.0, 2.0)).unwrap();
    let before = h.store.fetch_current(1).unwrap().unwrap();

    let mut noisy = mk_fix(48.5, 2.5);
    noisy.accuracy_m = Some(250.0);
    noisy.battery = Some(42.0);
    let outcome = h.engine.submit_fix(1, 1, &noisy).unwrap();

    assert_eq!(outcome.decision, QualityDecision::Touch);
    let after = h.store.fetch_current(1).unwrap().unwrap();
    assert_eq!(after.lat, 48.0, "touch must not move the position");
    assert_eq!(after.lng, 2.0);
    assert_eq!(after.battery, Some(42.0));
    assert!(after.updated_at >= before.updated_at);
}

#[test]
fn fast_stationary_fix_is_rejected_with_no_write_at_all() {
    let h = harness(EngineConfig::default());
    let mut jump = mk_fix(48.0, 2.0);
    jump.speed = Some(200.0 / 3.6);
    jump.is_moving = false;
    let outcome = h.engine.submit_fix(1, 1, &jump).unwrap();

    assert_eq!(outcome.decision, QualityDecision::Reject);
    assert!(h.store.fetch_current(1).unwrap().is_none(), "not even a heartbeat");
    assert_eq!(h.store.queue_depth().unwrap().pending, 0);
    let history = h
        .engine
        .history(1, 1, Utc::now() - chrono::Duration::hours(1), Utc::now(), 10)
        .unwrap();
    assert!(history.is_empty());
}

#[test]
fn near_duplicate_fixes_skip_history_and_downstream_work() {
    let h = harness(EngineConfig::default());
    h.engine.submit_fix(1, 1, &mk_fix(48.0, 2.0)).unwrap();

    // ~5 m north: the position may move, but downstream work is skipped.
    let outcome = h.engine.submit_fix(1, 1, &mk_fix(48.000045, 2.0)).unwrap();
    assert_eq!(outcome.decision, QualityDecision::Promote);
    assert!(outcome.duplicate);
    assert!(!outcome.queued);

    let history = h
        .engine
        .history(1, 1, Utc::now() - chrono::Duration::hours(1), Utc::now(), 10)
        .unwrap();
    assert_eq!(history.len(), 1, "duplicate fixes do not append history");
    assert_eq!(h.store.queue_depth().unwrap().pending, 1);

    // ~50 m from the first recorded point: no longer a duplicate.
    let outcome = h.engine.submit_fix(1, 1, &mk_fix(48.00045, 2.0)).unwrap();
    assert!(!outcome.duplicate);
    assert_eq!(h.store.queue_depth().unwrap().pending, 2);
}

#[test]
fn malformed_fix_fails_validation_without_mutation() {
    let h = harness(EngineConfig::default());
    let bad = mk_fix(91.0, 2.0);
    let err = h.engine.submit_fix(1, 1, &bad).unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(h.store.fetch_current(1).unwrap().is_none());
}

#[test]
fn processing_budget_throttles_downstream_but_not_writes() {
    let cfg = EngineConfig {
        rate_limit_per_minute: 2,
        ..EngineConfig::default()
    };
    let h = harness(cfg);

    let outcomes: Vec<FixOutcome> = (0..3)
        .map(|i| {
            // Spread fixes ~100 m apart so dedupe stays out of the way.
            h.engine
                .submit_fix(1, 1, &mk_fix(48.0 + i as f64 * 0.001, 2.0))
                .unwrap()
        })
        .collect();

    assert!(!outcomes[0].throttled);
    assert!(!outcomes[1].throttled);
    assert!(outcomes[2].throttled);
    assert!(!outcomes[2].queued);

    // All three writes landed; only the downstream work was capped.
    let history = h
        .engine
        .history(1, 1, Utc::now() - chrono::Duration::hours(1), Utc::now(), 10)
        .unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(h.store.queue_depth().unwrap().pending, 2);
}

#[test]
fn family_snapshot_reflects_every_member_and_repairs_from_the_store() {
    let h = harness(EngineConfig::default());
    h.engine.submit_fix(1, 1, &mk_fix(48.0, 2.0)).unwrap();
    h.engine.submit_fix(2, 1, &mk_fix(48.01, 2.01)).unwrap();

    let snapshot = h.engine.family_snapshot(1).unwrap();
    assert_eq!(snapshot.len(), 2);

    // The snapshot is a cached read; a second call answers from cache with
    // the same content.
    let again = h.engine.family_snapshot(1).unwrap();
    assert_eq!(again.len(), 2);
}

#[test]
fn current_for_falls_back_to_the_store_and_repairs_the_cache() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = Arc::new(MemoryCache::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = IngestEngine::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&cache) as Arc<dyn CacheHandle>,
        notifier as Arc<dyn Notifier>,
        EngineConfig::default(),
    );

    engine.submit_fix(1, 1, &mk_fix(48.0, 2.0)).unwrap();
    // Simulate cache eviction.
    cache.delete(&hearthmap_common::keys::current_location(1)).unwrap();

    let current = engine.current_for(1).unwrap().expect("store fallback");
    assert_eq!(current.lat, 48.0);
    // Cache was repaired on the way out.
    assert!(
        cache
            .get_raw(&hearthmap_common::keys::current_location(1))
            .unwrap()
            .is_some()
    );
}
