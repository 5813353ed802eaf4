use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use hearthmap_core::model::{
    AlertRule, CurrentLocation, EventRecord, FamilySettings, Geofence, GeofenceState,
    HistoryPoint, QueuedFix, TrackingSession,
};

/// New history row, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewHistoryPoint {
    pub user_id: i64,
    pub family_id: i64,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
    pub speed: Option<f64>,
    pub battery: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// New queue row, before the store assigns an id and stamps `created_at`.
#[derive(Debug, Clone)]
pub struct NewQueuedFix {
    pub user_id: i64,
    pub family_id: i64,
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    pub battery: Option<f64>,
    pub is_moving: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: i64,
    pub family_id: i64,
    pub mode: String,
    pub interval_secs: u32,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub family_id: i64,
    pub user_id: Option<i64>,
    pub kind: String,
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: u64,
    pub failed: u64,
}

/// Durable store behind the engine. One current row per user, an append-only
/// history, sessions, zones and their per-user state, rules, audit events,
/// per-family settings, and the geofence processing queue.
pub trait Store: Send + Sync {
    // Current location. The upsert is atomic per user: concurrent fixes for
    // one user resolve last-writer-wins at the store.
    fn upsert_current(&self, record: &CurrentLocation) -> Result<()>;
    fn touch_current(
        &self,
        user_id: i64,
        battery: Option<f64>,
        is_moving: bool,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    fn fetch_current(&self, user_id: i64) -> Result<Option<CurrentLocation>>;
    fn fetch_family_current(&self, family_id: i64) -> Result<Vec<CurrentLocation>>;

    // History.
    fn append_history(&self, point: &NewHistoryPoint) -> Result<i64>;
    fn fetch_history(
        &self,
        user_id: i64,
        family_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>>;
    fn prune_history_before(
        &self,
        family_id: i64,
        cutoff: DateTime<Utc>,
        batch: usize,
    ) -> Result<usize>;

    // Sessions.
    fn insert_session(&self, session: &NewSession) -> Result<i64>;
    fn active_session(&self, user_id: i64, now: DateTime<Utc>) -> Result<Option<TrackingSession>>;
    fn stop_active_sessions(&self, user_id: i64, at: DateTime<Utc>) -> Result<usize>;
    /// Stops every active session in the family; returns the affected users
    /// so callers can clear liveness flags.
    fn stop_family_sessions(&self, family_id: i64, at: DateTime<Utc>) -> Result<Vec<i64>>;
    fn touch_keepalive(&self, user_id: i64, at: DateTime<Utc>) -> Result<bool>;
    /// Marks overdue active sessions expired; returns the affected users.
    fn expire_sessions(&self, now: DateTime<Utc>) -> Result<Vec<i64>>;

    // Geofences.
    fn insert_geofence(&self, fence: &Geofence) -> Result<i64>;
    fn list_active_geofences(&self, family_id: i64) -> Result<Vec<Geofence>>;
    fn fetch_geofence_state(&self, fence_id: i64, user_id: i64) -> Result<Option<GeofenceState>>;
    fn upsert_geofence_state(&self, state: &GeofenceState) -> Result<()>;

    // Alert rules. Decode failures on individual rows are logged and skipped
    // so one bad condition payload cannot take out the whole rule set.
    fn insert_alert_rule(&self, rule: &AlertRule) -> Result<i64>;
    fn list_alert_rules(&self, family_id: i64) -> Result<Vec<AlertRule>>;

    // Audit events.
    fn append_event(&self, event: &NewEvent) -> Result<i64>;
    fn fetch_events(&self, family_id: i64, limit: usize) -> Result<Vec<EventRecord>>;
    fn prune_events_before(
        &self,
        family_id: i64,
        cutoff: DateTime<Utc>,
        batch: usize,
    ) -> Result<usize>;

    // Settings and membership.
    fn fetch_settings(&self, family_id: i64) -> Result<Option<FamilySettings>>;
    fn upsert_settings(&self, family_id: i64, settings: &FamilySettings) -> Result<()>;
    fn set_member_sharing(&self, family_id: i64, user_id: i64, share: bool) -> Result<()>;
    /// Users in the family with a current location and sharing not switched
    /// off.
    fn list_sharing_members(&self, family_id: i64) -> Result<Vec<i64>>;
    /// Every family the store knows about, for whole-fleet jobs.
    fn list_family_ids(&self) -> Result<Vec<i64>>;

    // Geofence processing queue.
    fn enqueue_fix(&self, item: &NewQueuedFix, now: DateTime<Utc>) -> Result<i64>;
    /// Oldest-first batch of pending items plus failed items still inside the
    /// retry window (measured from enqueue time).
    fn claim_queue_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        retry_window: Duration,
    ) -> Result<Vec<QueuedFix>>;
    fn mark_queue_processed(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
    fn mark_queue_failed(&self, id: i64, at: DateTime<Utc>, error: &str) -> Result<()>;
    /// Housekeeping: processed items older than a day, failed items older
    /// than an hour.
    fn prune_queue(&self, now: DateTime<Utc>) -> Result<usize>;
    fn queue_depth(&self) -> Result<QueueDepth>;
}

static QUEUE_PENDING: AtomicU64 = AtomicU64::new(0);
static QUEUE_FAILED: AtomicU64 = AtomicU64::new(0);
static LAST_RUN_AT_EPOCH: AtomicI64 = AtomicI64::new(0);

static METRICS_CH: OnceCell<(watch::Sender<QueueMetrics>, watch::Receiver<QueueMetrics>)> =
    OnceCell::new();

fn init_metrics_channel() -> &'static (watch::Sender<QueueMetrics>, watch::Receiver<QueueMetrics>) {
    METRICS_CH.get_or_init(|| {
        let initial = queue_metrics_snapshot();
        watch::channel(initial)
    })
}

#[derive(Clone, Debug)]
pub struct QueueMetrics {
    pub pending: u64,
    pub failed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

pub fn publish_queue_depth(depth: QueueDepth) {
    QUEUE_PENDING.store(depth.pending, Ordering::Relaxed);
    QUEUE_FAILED.store(depth.failed, Ordering::Relaxed);
    publish_metrics();
}

pub fn set_last_run(t: DateTime<Utc>) {
    LAST_RUN_AT_EPOCH.store(t.timestamp(), Ordering::Relaxed);
    publish_metrics();
}

fn queue_metrics_snapshot() -> QueueMetrics {
    let secs = LAST_RUN_AT_EPOCH.load(Ordering::Relaxed);
    let last = if secs > 0 {
        Utc.timestamp_opt(secs, 0).single()
    } else {
        None
    };
    QueueMetrics {
        pending: QUEUE_PENDING.load(Ordering::Relaxed),
        failed: QUEUE_FAILED.load(Ordering::Relaxed),
        last_run_at: last,
    }
}

fn publish_metrics() {
    let (tx, _rx) = init_metrics_channel();
    let _ = tx.send(queue_metrics_snapshot());
}

pub fn queue_metrics_watch() -> watch::Receiver<QueueMetrics> {
    let (_tx, rx) = init_metrics_channel();
    rx.clone()
}

pub mod sqlite3;
