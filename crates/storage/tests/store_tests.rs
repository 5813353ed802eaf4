use chrono::{Duration, Utc};
use hearthmap_core::model::{
    AlertCondition, AlertRule, CurrentLocation, FamilySettings, Geofence, GeofenceShape,
    GeofenceState, LocationSource, QueueStatus,
};
use hearthmap_storage::sqlite3::SqliteStore;
use hearthmap_storage::{NewHistoryPoint, NewQueuedFix, NewSession, Store};
use std::time::Duration as StdDuration;

fn store() -> SqliteStore {
    SqliteStore::open_in_memory().expect("open in-memory store")
}

fn current(user_id: i64, lat: f64, lng: f64) -> CurrentLocation {
    CurrentLocation {
        user_id,
        family_id: 1,
        lat,
        lng,
        accuracy_m: Some(12.0),
        speed: Some(3.0),
        heading: Some(90.0),
        battery: Some(75.0),
        is_moving: true,
        quality_score: 95,
        source: LocationSource::Gps,
        updated_at: Utc::now(),
    }
}

#[test]
fn upsert_current_is_one_row_per_user() {
    let store = store();
    store.upsert_current(&current(1, 48.0, 2.0)).unwrap();
    store.upsert_current(&current(1, 48.5, 2.5)).unwrap();

    let rec = store.fetch_current(1).unwrap().expect("record exists");
    assert_eq!(rec.lat, 48.5);
    assert_eq!(rec.lng, 2.5);
    assert_eq!(store.fetch_family_current(1).unwrap().len(), 1);
}

#[test]
fn touch_moves_liveness_fields_but_not_position() {
    let store = store();
    let before = current(1, 48.0, 2.0);
    store.upsert_current(&before).unwrap();

    let later = Utc::now() + Duration::seconds(30);
    let touched = store
        .touch_current(1, Some(12.0), false, later)
        .unwrap();
    assert!(touched);

    let rec = store.fetch_current(1).unwrap().unwrap();
    assert_eq!(rec.lat, 48.0);
    assert_eq!(rec.lng, 2.0);
    assert_eq!(rec.battery, Some(12.0));
    assert!(!rec.is_moving);
    assert!(rec.updated_at > before.updated_at);
}

#[test]
fn touch_without_a_record_is_a_noop() {
    let store = store();
    assert!(!store.touch_current(99, Some(50.0), true, Utc::now()).unwrap());
    assert!(store.fetch_current(99).unwrap().is_none());
}

#[test]
fn history_is_append_only_and_range_queried() {
    let store = store();
    let now = Utc::now();
    for i in 0..5 {
        store
            .append_history(&NewHistoryPoint {
                user_id: 1,
                family_id: 1,
                lat: 48.0 + i as f64 * 0.001,
                lng: 2.0,
                accuracy_m: Some(10.0),
                speed: None,
                battery: None,
                recorded_at: now - Duration::minutes(10 - i),
            })
            .unwrap();
    }

    let all = store
        .fetch_history(1, 1, now - Duration::hours(1), now, 100)
        .unwrap();
    assert_eq!(all.len(), 5);
    assert!(all.windows(2).all(|w| w[0].recorded_at <= w[1].recorded_at));

    let limited = store
        .fetch_history(1, 1, now - Duration::hours(1), now, 2)
        .unwrap();
    assert_eq!(limited.len(), 2);
}

#[test]
fn history_pruning_deletes_in_batches() {
    let store = store();
    let now = Utc::now();
    for i in 0..10 {
        store
            .append_history(&NewHistoryPoint {
                user_id: 1,
                family_id: 1,
                lat: 48.0,
                lng: 2.0,
                accuracy_m: None,
                speed: None,
                battery: None,
                recorded_at: now - Duration::days(100 + i),
            })
            .unwrap();
    }
    let cutoff = now - Duration::days(90);
    assert_eq!(store.prune_history_before(1, cutoff, 4).unwrap(), 4);
    assert_eq!(store.prune_history_before(1, cutoff, 4).unwrap(), 4);
    assert_eq!(store.prune_history_before(1, cutoff, 4).unwrap(), 2);
    assert_eq!(store.prune_history_before(1, cutoff, 4).unwrap(), 0);
}

#[test]
fn session_lifecycle_stop_then_insert_then_expire() {
    let store = store();
    let now = Utc::now();

    store
        .insert_session(&NewSession {
            user_id: 1,
            family_id: 1,
            mode: "precise".to_string(),
            interval_secs: 15,
            started_at: now,
            expires_at: now + Duration::hours(2),
        })
        .unwrap();
    assert!(store.active_session(1, now).unwrap().is_some());

    assert_eq!(store.stop_active_sessions(1, now).unwrap(), 1);
    assert!(store.active_session(1, now).unwrap().is_none());

    // A session already past its expiry is swept into `expired`.
    store
        .insert_session(&NewSession {
            user_id: 2,
            family_id: 1,
            mode: "passive".to_string(),
            interval_secs: 60,
            started_at: now - Duration::hours(3),
            expires_at: now - Duration::hours(1),
        })
        .unwrap();
    let expired = store.expire_sessions(now).unwrap();
    assert_eq!(expired, vec![2]);
    assert!(store.active_session(2, now).unwrap().is_none());
}

#[test]
fn keepalive_touches_only_active_sessions() {
    let store = store();
    let now = Utc::now();
    assert!(!store.touch_keepalive(1, now).unwrap());

    store
        .insert_session(&NewSession {
            user_id: 1,
            family_id: 1,
            mode: "precise".to_string(),
            interval_secs: 15,
            started_at: now,
            expires_at: now + Duration::hours(2),
        })
        .unwrap();
    assert!(store.touch_keepalive(1, now + Duration::seconds(30)).unwrap());
    let session = store.active_session(1, now).unwrap().unwrap();
    assert!(session.last_keepalive.is_some());
}

#[test]
fn stop_family_sessions_reports_affected_users() {
    let store = store();
    let now = Utc::now();
    for user_id in [1, 2] {
        store
            .insert_session(&NewSession {
                user_id,
                family_id: 1,
                mode: "precise".to_string(),
                interval_secs: 15,
                started_at: now,
                expires_at: now + Duration::hours(2),
            })
            .unwrap();
    }
    let mut users = store.stop_family_sessions(1, now).unwrap();
    users.sort_unstable();
    assert_eq!(users, vec![1, 2]);
}

#[test]
fn geofence_roundtrip_and_state_upsert() {
    let store = store();
    let fence_id = store
        .insert_geofence(&Geofence {
            id: 0,
            family_id: 1,
            name: "school".to_string(),
            shape: GeofenceShape::Circle {
                lat: 48.0,
                lng: 2.0,
                radius_m: 200.0,
            },
            notify_enter: true,
            notify_exit: false,
            active: true,
        })
        .unwrap();

    let fences = store.list_active_geofences(1).unwrap();
    assert_eq!(fences.len(), 1);
    assert_eq!(fences[0].id, fence_id);
    assert_eq!(fences[0].name, "school");

    assert!(store.fetch_geofence_state(fence_id, 1).unwrap().is_none());
    let now = Utc::now();
    store
        .upsert_geofence_state(&GeofenceState {
            fence_id,
            user_id: 1,
            is_inside: true,
            entered_at: Some(now),
            exited_at: None,
        })
        .unwrap();
    let state = store.fetch_geofence_state(fence_id, 1).unwrap().unwrap();
    assert!(state.is_inside);
    assert!(state.entered_at.is_some());
    assert!(state.exited_at.is_none());
}

#[test]
fn alert_rules_skip_undecodable_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("store.sqlite3");
    let store = SqliteStore::new(&db_path).unwrap();
    store
        .insert_alert_rule(&AlertRule {
            id: 0,
            family_id: 1,
            name: "too fast".to_string(),
            condition: AlertCondition::Speed { limit_kmh: 110.0 },
            target_user_id: None,
            notify_user_ids: vec![1],
            active: true,
        })
        .unwrap();

    // A legacy row with a hand-mangled condition payload, injected behind the
    // store's back.
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "INSERT INTO alert_rules (family_id, name, condition, target_user_id, notify_user_ids, active)
         VALUES (1, 'broken', '{not json', NULL, '[]', 1)",
        [],
    )
    .unwrap();
    drop(conn);

    let rules = store.list_alert_rules(1).unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].name, "too fast");
}

#[test]
fn settings_and_sharing_membership() {
    let store = store();
    assert!(store.fetch_settings(1).unwrap().is_none());

    let mut settings = FamilySettings::default();
    settings.retention_days = 30;
    store.upsert_settings(1, &settings).unwrap();
    assert_eq!(store.fetch_settings(1).unwrap().unwrap().retention_days, 30);

    store.upsert_current(&current(1, 48.0, 2.0)).unwrap();
    store.upsert_current(&current(2, 48.1, 2.1)).unwrap();
    assert_eq!(store.list_sharing_members(1).unwrap(), vec![1, 2]);

    store.set_member_sharing(1, 2, false).unwrap();
    assert_eq!(store.list_sharing_members(1).unwrap(), vec![1]);

    assert_eq!(store.list_family_ids().unwrap(), vec![1]);
}

#[test]
fn queue_lifecycle_claim_mark_prune() {
    let store = store();
    let now = Utc::now();
    let retry_window = StdDuration::from_secs(3600);

    let item = NewQueuedFix {
        user_id: 1,
        family_id: 1,
        lat: 48.0,
        lng: 2.0,
        speed: Some(3.0),
        battery: Some(50.0),
        is_moving: true,
        recorded_at: now,
    };
    let first = store.enqueue_fix(&item, now).unwrap();
    let second = store.enqueue_fix(&item, now).unwrap();

    let batch = store.claim_queue_batch(10, now, retry_window).unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].id, first);
    assert_eq!(batch[0].status, QueueStatus::Pending);

    store.mark_queue_processed(first, now).unwrap();
    store.mark_queue_failed(second, now, "boom").unwrap();

    // Failed-but-recent items stay eligible; processed ones do not.
    let batch = store.claim_queue_batch(10, now, retry_window).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, second);
    assert_eq!(batch[0].status, QueueStatus::Failed);
    assert_eq!(batch[0].error.as_deref(), Some("boom"));

    let depth = store.queue_depth().unwrap();
    assert_eq!(depth.pending, 0);
    assert_eq!(depth.failed, 1);

    // Outside the retry window the failed item is no longer claimable and
    // housekeeping removes it.
    let much_later = now + Duration::hours(2);
    assert!(store
        .claim_queue_batch(10, much_later, retry_window)
        .unwrap()
        .is_empty());
    assert_eq!(store.prune_queue(much_later).unwrap(), 1);

    // The processed row goes a day later.
    let next_day = now + Duration::hours(25);
    assert_eq!(store.prune_queue(next_day).unwrap(), 1);
    let depth = store.queue_depth().unwrap();
    assert_eq!(depth, Default::default());
}
