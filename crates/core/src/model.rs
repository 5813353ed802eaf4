use crate::error::EngineError;
use crate::geo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One location sample from a device. Ephemeral input; nothing here is
/// trusted until the quality gate has classified it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationFix {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
    /// Meters per second, as devices report it.
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    /// Percent, 0-100.
    pub battery: Option<f64>,
    pub is_moving: bool,
    pub recorded_at: DateTime<Utc>,
}

impl LocationFix {
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed.map(|v| v * geo::MS_TO_KMH)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(EngineError::validation(format!(
                "latitude out of range: {}",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(EngineError::validation(format!(
                "longitude out of range: {}",
                self.lng
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationSource {
    Unknown,
    Gps,
    Fused,
    Network,
}

impl LocationSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Gps => "gps",
            Self::Fused => "fused",
            Self::Network => "network",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "gps" => Self::Gps,
            "fused" => Self::Fused,
            "network" => Self::Network,
            _ => Self::Unknown,
        }
    }
}

/// The authoritative position record, one per user. Position moves only when
/// the quality gate promotes a fix; touches refresh liveness fields only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentLocation {
    pub user_id: i64,
    pub family_id: i64,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub battery: Option<f64>,
    pub is_moving: bool,
    pub quality_score: i32,
    pub source: LocationSource,
    pub updated_at: DateTime<Utc>,
}

/// Append-only trail row, one per accepted fix that survived dedupe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub id: i64,
    pub user_id: i64,
    pub family_id: i64,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
    pub speed: Option<f64>,
    pub battery: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Stopped,
    Expired,
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Expired => "expired",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "active" => Self::Active,
            "stopped" => Self::Stopped,
            _ => Self::Expired,
        }
    }
}

/// A user's live-tracking intent. At most one active session per user; the
/// session gate enforces that by stopping any prior session on start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSession {
    pub id: i64,
    pub user_id: i64,
    pub family_id: i64,
    pub status: SessionStatus,
    pub mode: String,
    pub interval_secs: u32,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_keepalive: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GeofenceShape {
    Circle {
        lat: f64,
        lng: f64,
        radius_m: f64,
    },
    Polygon {
        /// (lat, lng) pairs; fewer than three vertices never match.
        vertices: Vec<(f64, f64)>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geofence {
    pub id: i64,
    pub family_id: i64,
    pub name: String,
    pub shape: GeofenceShape,
    pub notify_enter: bool,
    pub notify_exit: bool,
    pub active: bool,
}

/// Per (geofence, user) membership. A transition event exists iff `is_inside`
/// flipped between two consecutive evaluations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeofenceState {
    pub fence_id: i64,
    pub user_id: i64,
    pub is_inside: bool,
    pub entered_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneTransition {
    Enter,
    Exit,
}

impl ZoneTransition {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
        }
    }
}

/// Emitted once per state flip, for the notification collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneEvent {
    pub fence_id: i64,
    pub fence_name: String,
    pub user_id: i64,
    pub family_id: i64,
    pub transition: ZoneTransition,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Speed,
    Battery,
    Inactivity,
}

impl AlertKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::Battery => "battery",
            Self::Inactivity => "inactivity",
        }
    }
}

/// Rule condition payload as stored in the rule row. Thresholds fall back to
/// the family-wide defaults when the payload omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AlertCondition {
    Speed {
        #[serde(default = "default_speed_limit_kmh")]
        limit_kmh: f64,
    },
    Battery {
        #[serde(default = "default_low_battery_pct")]
        floor_pct: f64,
    },
    Inactivity {
        #[serde(default = "default_inactivity_window_secs")]
        window_secs: u64,
    },
}

pub fn default_speed_limit_kmh() -> f64 {
    120.0
}

pub fn default_low_battery_pct() -> f64 {
    15.0
}

pub fn default_inactivity_window_secs() -> u64 {
    6 * 3600
}

impl AlertCondition {
    pub fn kind(&self) -> AlertKind {
        match self {
            Self::Speed { .. } => AlertKind::Speed,
            Self::Battery { .. } => AlertKind::Battery,
            Self::Inactivity { .. } => AlertKind::Inactivity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub family_id: i64,
    pub name: String,
    pub condition: AlertCondition,
    /// None scopes the rule to every family member.
    pub target_user_id: Option<i64>,
    pub notify_user_ids: Vec<i64>,
    pub active: bool,
}

/// Descriptor handed to the notification collaborator. `rule_id` is absent
/// for built-in detections (the background low-battery sweep).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredAlert {
    pub rule_id: Option<i64>,
    pub name: String,
    pub kind: AlertKind,
}

/// Family-level knobs, read-only from the engine's perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilySettings {
    pub update_interval_secs: u32,
    pub retention_days: u32,
    pub speed_limit_kmh: f64,
    pub low_battery_pct: f64,
}

impl Default for FamilySettings {
    fn default() -> Self {
        Self {
            update_interval_secs: 30,
            retention_days: 90,
            speed_limit_kmh: default_speed_limit_kmh(),
            low_battery_pct: default_low_battery_pct(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processed,
    Failed,
}

impl QueueStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "processed" => Self::Processed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A fix parked for the background processor: just enough of the original
/// sample to run zone and battery detection off the write path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedFix {
    pub id: i64,
    pub user_id: i64,
    pub family_id: i64,
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    pub battery: Option<f64>,
    pub is_moving: bool,
    pub recorded_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub attempted_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Audit trail row for zone transitions and raised alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub family_id: i64,
    pub user_id: Option<i64>,
    pub kind: String,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
}
