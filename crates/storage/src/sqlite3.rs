use crate::{
    NewEvent, NewHistoryPoint, NewQueuedFix, NewSession, QueueDepth, Store,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use hearthmap_core::model::{
    AlertRule, CurrentLocation, EventRecord, FamilySettings, Geofence, GeofenceState,
    HistoryPoint, LocationSource, QueueStatus, QueuedFix, SessionStatus, TrackingSession,
};

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp in DB: {raw}"))
}

fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        Some(s) => Ok(Some(parse_ts(&s)?)),
        None => Ok(None),
    }
}

pub struct SqliteStore {
    #[allow(dead_code)]
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let conn = Connection::open(&db_path)?;
        Self::init_db(&conn)?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_db(&conn)?;
        Ok(Self {
            db_path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    fn init_db(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", -4000)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS current_locations (
                user_id INTEGER PRIMARY KEY,
                family_id INTEGER NOT NULL,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                accuracy_m REAL,
                speed REAL,
                heading REAL,
                battery REAL,
                is_moving INTEGER NOT NULL,
                quality_score INTEGER NOT NULL,
                source TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_current_locations_family ON current_locations(family_id);
            CREATE TABLE IF NOT EXISTS location_history (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                family_id INTEGER NOT NULL,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                accuracy_m REAL,
                speed REAL,
                battery REAL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_location_history_user_time ON location_history(user_id, recorded_at);
            CREATE INDEX IF NOT EXISTS idx_location_history_family_time ON location_history(family_id, recorded_at);
            CREATE TABLE IF NOT EXISTS tracking_sessions (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                family_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                interval_secs INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                last_keepalive TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tracking_sessions_user ON tracking_sessions(user_id, status);
            CREATE TABLE IF NOT EXISTS geofences (
                id INTEGER PRIMARY KEY,
                family_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                shape TEXT NOT NULL,
                notify_enter INTEGER NOT NULL,
                notify_exit INTEGER NOT NULL,
                active INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_geofences_family ON geofences(family_id, active);
            CREATE TABLE IF NOT EXISTS geofence_states (
                fence_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                is_inside INTEGER NOT NULL,
                entered_at TEXT,
                exited_at TEXT,
                PRIMARY KEY (fence_id, user_id)
            );
            CREATE TABLE IF NOT EXISTS alert_rules (
                id INTEGER PRIMARY KEY,
                family_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                condition TEXT NOT NULL,
                target_user_id INTEGER,
                notify_user_ids TEXT NOT NULL,
                active INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alert_rules_family ON alert_rules(family_id, active);
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY,
                family_id INTEGER NOT NULL,
                user_id INTEGER,
                kind TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_family_time ON events(family_id, created_at);
            CREATE TABLE IF NOT EXISTS family_settings (
                family_id INTEGER PRIMARY KEY,
                update_interval_secs INTEGER NOT NULL,
                retention_days INTEGER NOT NULL,
                speed_limit_kmh REAL NOT NULL,
                low_battery_pct REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS member_settings (
                family_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                share_location INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (family_id, user_id)
            );
            CREATE TABLE IF NOT EXISTS geofence_queue (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                family_id INTEGER NOT NULL,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                speed REAL,
                battery REAL,
                is_moving INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempted_at TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_geofence_queue_status ON geofence_queue(status, created_at);",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection mutex poisoned")
    }

    fn current_from_row(row: &rusqlite::Row<'_>) -> Result<CurrentLocation> {
        let source_s: String = row.get(10)?;
        let updated_s: String = row.get(11)?;
        Ok(CurrentLocation {
            user_id: row.get(0)?,
            family_id: row.get(1)?,
            lat: row.get(2)?,
            lng: row.get(3)?,
            accuracy_m: row.get(4)?,
            speed: row.get(5)?,
            heading: row.get(6)?,
            battery: row.get(7)?,
            is_moving: row.get::<_, i64>(8)? != 0,
            quality_score: row.get(9)?,
            source: LocationSource::from_label(&source_s),
            updated_at: parse_ts(&updated_s)?,
        })
    }
}

const CURRENT_COLUMNS: &str = "user_id, family_id, lat, lng, accuracy_m, speed, heading, battery, is_moving, quality_score, source, updated_at";

impl Store for SqliteStore {
    fn upsert_current(&self, record: &CurrentLocation) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO current_locations (user_id, family_id, lat, lng, accuracy_m, speed, heading, battery, is_moving, quality_score, source, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(user_id) DO UPDATE SET
                family_id = excluded.family_id,
                lat = excluded.lat,
                lng = excluded.lng,
                accuracy_m = excluded.accuracy_m,
                speed = excluded.speed,
                heading = excluded.heading,
                battery = excluded.battery,
                is_moving = excluded.is_moving,
                quality_score = excluded.quality_score,
                source = excluded.source,
                updated_at = excluded.updated_at",
            params![
                record.user_id,
                record.family_id,
                record.lat,
                record.lng,
                record.accuracy_m,
                record.speed,
                record.heading,
                record.battery,
                record.is_moving as i64,
                record.quality_score,
                record.source.label(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to upsert current location")?;
        Ok(())
    }

    fn touch_current(
        &self,
        user_id: i64,
        battery: Option<f64>,
        is_moving: bool,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE current_locations SET battery = ?1, is_moving = ?2, updated_at = ?3 WHERE user_id = ?4",
                params![battery, is_moving as i64, at.to_rfc3339(), user_id],
            )
            .context("Failed to touch current location")?;
        Ok(changed > 0)
    }

    fn fetch_current(&self, user_id: i64) -> Result<Option<CurrentLocation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CURRENT_COLUMNS} FROM current_locations WHERE user_id = ?1"
        ))?;
        let mut rows = stmt.query([user_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::current_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn fetch_family_current(&self, family_id: i64) -> Result<Vec<CurrentLocation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CURRENT_COLUMNS} FROM current_locations WHERE family_id = ?1 ORDER BY user_id ASC"
        ))?;
        let mut rows = stmt.query([family_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::current_from_row(row)?);
        }
        Ok(out)
    }

    fn append_history(&self, point: &NewHistoryPoint) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO location_history (user_id, family_id, lat, lng, accuracy_m, speed, battery, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                point.user_id,
                point.family_id,
                point.lat,
                point.lng,
                point.accuracy_m,
                point.speed,
                point.battery,
                point.recorded_at.to_rfc3339(),
            ],
        )
        .context("Failed to append history point")?;
        Ok(conn.last_insert_rowid())
    }

    fn fetch_history(
        &self,
        user_id: i64,
        family_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, family_id, lat, lng, accuracy_m, speed, battery, recorded_at
             FROM location_history
             WHERE user_id = ?1 AND family_id = ?2 AND recorded_at >= ?3 AND recorded_at <= ?4
             ORDER BY recorded_at ASC
             LIMIT ?5",
        )?;
        let mut rows = stmt.query(params![
            user_id,
            family_id,
            from.to_rfc3339(),
            to.to_rfc3339(),
            limit as i64,
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let recorded_s: String = row.get(8)?;
            out.push(HistoryPoint {
                id: row.get(0)?,
                user_id: row.get(1)?,
                family_id: row.get(2)?,
                lat: row.get(3)?,
                lng: row.get(4)?,
                accuracy_m: row.get(5)?,
                speed: row.get(6)?,
                battery: row.get(7)?,
                recorded_at: parse_ts(&recorded_s)?,
            });
        }
        Ok(out)
    }

    fn prune_history_before(
        &self,
        family_id: i64,
        cutoff: DateTime<Utc>,
        batch: usize,
    ) -> Result<usize> {
        let conn = self.lock();
        let deleted = conn
            .execute(
                "DELETE FROM location_history WHERE id IN (
                    SELECT id FROM location_history
                    WHERE family_id = ?1 AND recorded_at < ?2
                    ORDER BY recorded_at ASC
                    LIMIT ?3
                )",
                params![family_id, cutoff.to_rfc3339(), batch as i64],
            )
            .context("Failed to prune history")?;
        Ok(deleted)
    }

    fn insert_session(&self, session: &NewSession) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tracking_sessions (user_id, family_id, status, mode, interval_secs, started_at, expires_at, last_keepalive)
             VALUES (?1, ?2, 'active', ?3, ?4, ?5, ?6, NULL)",
            params![
                session.user_id,
                session.family_id,
                session.mode,
                session.interval_secs,
                session.started_at.to_rfc3339(),
                session.expires_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert tracking session")?;
        Ok(conn.last_insert_rowid())
    }

    fn active_session(&self, user_id: i64, now: DateTime<Utc>) -> Result<Option<TrackingSession>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, family_id, status, mode, interval_secs, started_at, expires_at, last_keepalive
             FROM tracking_sessions
             WHERE user_id = ?1 AND status = 'active' AND expires_at > ?2
             ORDER BY started_at DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query(params![user_id, now.to_rfc3339()])?;
        match rows.next()? {
            Some(row) => {
                let status_s: String = row.get(3)?;
                let started_s: String = row.get(6)?;
                let expires_s: String = row.get(7)?;
                let keepalive_s: Option<String> = row.get(8)?;
                Ok(Some(TrackingSession {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    family_id: row.get(2)?,
                    status: SessionStatus::from_label(&status_s),
                    mode: row.get(4)?,
                    interval_secs: row.get(5)?,
                    started_at: parse_ts(&started_s)?,
                    expires_at: parse_ts(&expires_s)?,
                    last_keepalive: parse_ts_opt(keepalive_s)?,
                }))
            }
            None => Ok(None),
        }
    }

    fn stop_active_sessions(&self, user_id: i64, at: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let stopped = conn
            .execute(
                "UPDATE tracking_sessions SET status = 'stopped', expires_at = ?1 WHERE user_id = ?2 AND status = 'active'",
                params![at.to_rfc3339(), user_id],
            )
            .context("Failed to stop sessions")?;
        Ok(stopped)
    }

    fn stop_family_sessions(&self, family_id: i64, at: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut users = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT user_id FROM tracking_sessions WHERE family_id = ?1 AND status = 'active'",
            )?;
            let mut rows = stmt.query([family_id])?;
            while let Some(row) = rows.next()? {
                users.push(row.get(0)?);
            }
        }
        tx.execute(
            "UPDATE tracking_sessions SET status = 'stopped', expires_at = ?1 WHERE family_id = ?2 AND status = 'active'",
            params![at.to_rfc3339(), family_id],
        )?;
        tx.commit()?;
        Ok(users)
    }

    fn touch_keepalive(&self, user_id: i64, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE tracking_sessions SET last_keepalive = ?1 WHERE user_id = ?2 AND status = 'active'",
                params![at.to_rfc3339(), user_id],
            )
            .context("Failed to record keepalive")?;
        Ok(changed > 0)
    }

    fn expire_sessions(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut users = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT user_id FROM tracking_sessions WHERE status = 'active' AND expires_at < ?1",
            )?;
            let mut rows = stmt.query([now.to_rfc3339()])?;
            while let Some(row) = rows.next()? {
                users.push(row.get(0)?);
            }
        }
        tx.execute(
            "UPDATE tracking_sessions SET status = 'expired' WHERE status = 'active' AND expires_at < ?1",
            [now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(users)
    }

    fn insert_geofence(&self, fence: &Geofence) -> Result<i64> {
        let shape_json = serde_json::to_string(&fence.shape)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO geofences (family_id, name, shape, notify_enter, notify_exit, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                fence.family_id,
                fence.name,
                shape_json,
                fence.notify_enter as i64,
                fence.notify_exit as i64,
                fence.active as i64,
            ],
        )
        .context("Failed to insert geofence")?;
        Ok(conn.last_insert_rowid())
    }

    fn list_active_geofences(&self, family_id: i64) -> Result<Vec<Geofence>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, family_id, name, shape, notify_enter, notify_exit, active
             FROM geofences
             WHERE family_id = ?1 AND active = 1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([family_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let shape_json: String = row.get(3)?;
            let shape = match serde_json::from_str(&shape_json) {
                Ok(shape) => shape,
                Err(e) => {
                    warn!("Skipping geofence {} with undecodable shape: {}", id, e);
                    continue;
                }
            };
            out.push(Geofence {
                id,
                family_id: row.get(1)?,
                name: row.get(2)?,
                shape,
                notify_enter: row.get::<_, i64>(4)? != 0,
                notify_exit: row.get::<_, i64>(5)? != 0,
                active: row.get::<_, i64>(6)? != 0,
            });
        }
        Ok(out)
    }

    fn fetch_geofence_state(&self, fence_id: i64, user_id: i64) -> Result<Option<GeofenceState>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT is_inside, entered_at, exited_at FROM geofence_states WHERE fence_id = ?1 AND user_id = ?2",
                params![fence_id, user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((inside, entered_s, exited_s)) => Ok(Some(GeofenceState {
                fence_id,
                user_id,
                is_inside: inside != 0,
                entered_at: parse_ts_opt(entered_s)?,
                exited_at: parse_ts_opt(exited_s)?,
            })),
            None => Ok(None),
        }
    }

    fn upsert_geofence_state(&self, state: &GeofenceState) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO geofence_states (fence_id, user_id, is_inside, entered_at, exited_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(fence_id, user_id) DO UPDATE SET
                is_inside = excluded.is_inside,
                entered_at = excluded.entered_at,
                exited_at = excluded.exited_at",
            params![
                state.fence_id,
                state.user_id,
                state.is_inside as i64,
                state.entered_at.map(|t| t.to_rfc3339()),
                state.exited_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("Failed to upsert geofence state")?;
        Ok(())
    }

    fn insert_alert_rule(&self, rule: &AlertRule) -> Result<i64> {
        let condition_json = serde_json::to_string(&rule.condition)?;
        let notify_json = serde_json::to_string(&rule.notify_user_ids)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO alert_rules (family_id, name, condition, target_user_id, notify_user_ids, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rule.family_id,
                rule.name,
                condition_json,
                rule.target_user_id,
                notify_json,
                rule.active as i64,
            ],
        )
        .context("Failed to insert alert rule")?;
        Ok(conn.last_insert_rowid())
    }

    fn list_alert_rules(&self, family_id: i64) -> Result<Vec<AlertRule>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, family_id, name, condition, target_user_id, notify_user_ids, active
             FROM alert_rules
             WHERE family_id = ?1 AND active = 1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([family_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let condition_json: String = row.get(3)?;
            // One bad payload must not take down the rest of the rule set.
            let condition = match serde_json::from_str(&condition_json) {
                Ok(condition) => condition,
                Err(e) => {
                    warn!("Skipping alert rule {} with undecodable condition: {}", id, e);
                    continue;
                }
            };
            let notify_json: String = row.get(5)?;
            let notify_user_ids = serde_json::from_str(&notify_json).unwrap_or_default();
            out.push(AlertRule {
                id,
                family_id: row.get(1)?,
                name: row.get(2)?,
                condition,
                target_user_id: row.get(4)?,
                notify_user_ids,
                active: row.get::<_, i64>(6)? != 0,
            });
        }
        Ok(out)
    }

    fn append_event(&self, event: &NewEvent) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events (family_id, user_id, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.family_id,
                event.user_id,
                event.kind,
                event.payload,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to append event")?;
        Ok(conn.last_insert_rowid())
    }

    fn fetch_events(&self, family_id: i64, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, family_id, user_id, kind, payload, created_at
             FROM events
             WHERE family_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![family_id, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let created_s: String = row.get(5)?;
            out.push(EventRecord {
                id: row.get(0)?,
                family_id: row.get(1)?,
                user_id: row.get(2)?,
                kind: row.get(3)?,
                payload: row.get(4)?,
                created_at: parse_ts(&created_s)?,
            });
        }
        Ok(out)
    }

    fn prune_events_before(
        &self,
        family_id: i64,
        cutoff: DateTime<Utc>,
        batch: usize,
    ) -> Result<usize> {
        let conn = self.lock();
        let deleted = conn
            .execute(
                "DELETE FROM events WHERE id IN (
                    SELECT id FROM events
                    WHERE family_id = ?1 AND created_at < ?2
                    ORDER BY created_at ASC
                    LIMIT ?3
                )",
                params![family_id, cutoff.to_rfc3339(), batch as i64],
            )
            .context("Failed to prune events")?;
        Ok(deleted)
    }

    fn fetch_settings(&self, family_id: i64) -> Result<Option<FamilySettings>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT update_interval_secs, retention_days, speed_limit_kmh, low_battery_pct
                 FROM family_settings WHERE family_id = ?1",
                [family_id],
                |row| {
                    Ok(FamilySettings {
                        update_interval_secs: row.get(0)?,
                        retention_days: row.get(1)?,
                        speed_limit_kmh: row.get(2)?,
                        low_battery_pct: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn upsert_settings(&self, family_id: i64, settings: &FamilySettings) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO family_settings (family_id, update_interval_secs, retention_days, speed_limit_kmh, low_battery_pct)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(family_id) DO UPDATE SET
                update_interval_secs = excluded.update_interval_secs,
                retention_days = excluded.retention_days,
                speed_limit_kmh = excluded.speed_limit_kmh,
                low_battery_pct = excluded.low_battery_pct",
            params![
                family_id,
                settings.update_interval_secs,
                settings.retention_days,
                settings.speed_limit_kmh,
                settings.low_battery_pct,
            ],
        )
        .context("Failed to upsert settings")?;
        Ok(())
    }

    fn set_member_sharing(&self, family_id: i64, user_id: i64, share: bool) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO member_settings (family_id, user_id, share_location)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(family_id, user_id) DO UPDATE SET share_location = excluded.share_location",
            params![family_id, user_id, share as i64],
        )
        .context("Failed to set member sharing")?;
        Ok(())
    }

    fn list_sharing_members(&self, family_id: i64) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT cl.user_id
             FROM current_locations cl
             LEFT JOIN member_settings ms
               ON ms.family_id = cl.family_id AND ms.user_id = cl.user_id
             WHERE cl.family_id = ?1 AND COALESCE(ms.share_location, 1) = 1
             ORDER BY cl.user_id ASC",
        )?;
        let mut rows = stmt.query([family_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    fn list_family_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT family_id FROM family_settings
             UNION
             SELECT DISTINCT family_id FROM current_locations
             ORDER BY family_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    fn enqueue_fix(&self, item: &NewQueuedFix, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO geofence_queue (user_id, family_id, lat, lng, speed, battery, is_moving, recorded_at, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending')",
            params![
                item.user_id,
                item.family_id,
                item.lat,
                item.lng,
                item.speed,
                item.battery,
                item.is_moving as i64,
                item.recorded_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .context("Failed to enqueue fix")?;
        Ok(conn.last_insert_rowid())
    }

    fn claim_queue_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        retry_window: Duration,
    ) -> Result<Vec<QueuedFix>> {
        let retry_floor = now - chrono::Duration::from_std(retry_window)?;
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, family_id, lat, lng, speed, battery, is_moving, recorded_at, created_at, status, attempted_at, error
             FROM geofence_queue
             WHERE status = 'pending' OR (status = 'failed' AND created_at >= ?1)
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![retry_floor.to_rfc3339(), limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let recorded_s: String = row.get(8)?;
            let created_s: String = row.get(9)?;
            let status_s: String = row.get(10)?;
            let attempted_s: Option<String> = row.get(11)?;
            out.push(QueuedFix {
                id: row.get(0)?,
                user_id: row.get(1)?,
                family_id: row.get(2)?,
                lat: row.get(3)?,
                lng: row.get(4)?,
                speed: row.get(5)?,
                battery: row.get(6)?,
                is_moving: row.get::<_, i64>(7)? != 0,
                recorded_at: parse_ts(&recorded_s)?,
                created_at: parse_ts(&created_s)?,
                status: QueueStatus::from_label(&status_s),
                attempted_at: parse_ts_opt(attempted_s)?,
                error: row.get(12)?,
            });
        }
        Ok(out)
    }

    fn mark_queue_processed(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE geofence_queue SET status = 'processed', attempted_at = ?1, error = NULL WHERE id = ?2",
            params![at.to_rfc3339(), id],
        )
        .context("Failed to mark queue item processed")?;
        Ok(())
    }

    fn mark_queue_failed(&self, id: i64, at: DateTime<Utc>, error: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE geofence_queue SET status = 'failed', attempted_at = ?1, error = ?2 WHERE id = ?3",
            params![at.to_rfc3339(), error, id],
        )
        .context("Failed to mark queue item failed")?;
        Ok(())
    }

    fn prune_queue(&self, now: DateTime<Utc>) -> Result<usize> {
        let processed_cutoff = now - chrono::Duration::hours(24);
        let failed_cutoff = now - chrono::Duration::hours(1);
        let conn = self.lock();
        let deleted = conn
            .execute(
                "DELETE FROM geofence_queue
                 WHERE (status = 'processed' AND attempted_at < ?1)
                    OR (status = 'failed' AND created_at < ?2)",
                params![processed_cutoff.to_rfc3339(), failed_cutoff.to_rfc3339()],
            )
            .context("Failed to prune queue")?;
        Ok(deleted)
    }

    fn queue_depth(&self) -> Result<QueueDepth> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM geofence_queue GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut depth = QueueDepth::default();
        while let Some(row) = rows.next()? {
            let status_s: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match status_s.as_str() {
                "pending" => depth.pending = count as u64,
                "failed" => depth.failed = count as u64,
                _ => {}
            }
        }
        Ok(depth)
    }
}
