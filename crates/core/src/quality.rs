//! The quality gate: scores an incoming fix and decides whether it may move a
//! user's authoritative position, merely refresh liveness, or be dropped.

use crate::geo;
use crate::model::{CurrentLocation, LocationFix, LocationSource};
use chrono::{DateTime, Utc};

/// Reported speed above this is implausible for a consumer device.
pub const IMPLAUSIBLE_SPEED_KMH: f64 = 300.0;
/// Speed above this while the device says it is stationary reads as a GPS
/// jump, whether reported or implied from displacement.
pub const STATIONARY_JUMP_KMH: f64 = 180.0;
/// Fixes noisier than this never move the position, only refresh liveness.
pub const UNTRUSTED_ACCURACY_M: f64 = 200.0;
/// A recent fix at least this good is not degraded by a much worse one.
pub const GOOD_ACCURACY_M: f64 = 50.0;
pub const POOR_ACCURACY_M: f64 = 100.0;
/// How long a good fix defends its position against worse ones.
pub const GOOD_FIX_SHIELD_SECS: i64 = 600;
/// Window for the displacement-implied teleport check.
pub const TELEPORT_WINDOW_SECS: i64 = 300;
/// Jitter floor while stationary; larger reported accuracy widens it.
pub const STATIONARY_JITTER_M: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityDecision {
    /// Accept the fix as the new authoritative position.
    Promote,
    /// Accept as a liveness signal only; the position stays put.
    Touch,
    /// Discard entirely, not even a heartbeat.
    Reject,
}

impl QualityDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Touch => "touch",
            Self::Reject => "reject",
        }
    }
}

fn accuracy_penalty(accuracy_m: Option<f64>) -> i32 {
    match accuracy_m {
        None => 30,
        Some(a) if a <= 10.0 => 0,
        Some(a) if a <= 25.0 => 5,
        Some(a) if a <= 50.0 => 10,
        Some(a) if a <= 100.0 => 25,
        Some(a) if a <= 200.0 => 50,
        Some(_) => 70,
    }
}

/// Integer quality score in [0, 100].
pub fn compute_score(fix: &LocationFix) -> i32 {
    let mut score = 100 - accuracy_penalty(fix.accuracy_m);
    if let Some(kmh) = fix.speed_kmh() {
        if kmh > IMPLAUSIBLE_SPEED_KMH {
            score -= 40;
        }
        if kmh > STATIONARY_JUMP_KMH && !fix.is_moving {
            score -= 30;
        }
    }
    score.clamp(0, 100)
}

pub fn classify_source(accuracy_m: Option<f64>) -> LocationSource {
    match accuracy_m {
        None => LocationSource::Unknown,
        Some(a) if a <= 20.0 => LocationSource::Gps,
        Some(a) if a <= 50.0 => LocationSource::Fused,
        Some(_) => LocationSource::Network,
    }
}

/// Decision rules in priority order; the first match wins.
///
/// The reported-speed check and the displacement-implied check are two
/// deliberately independent signals for the same failure mode (a GPS jump
/// while stationary): a device can lie about its speed, and a device can
/// report zero speed while its position teleports.
pub fn decide(
    fix: &LocationFix,
    last: Option<&CurrentLocation>,
    now: DateTime<Utc>,
) -> QualityDecision {
    // Too noisy to trust the position, but the device is clearly alive.
    if fix.accuracy_m.is_some_and(|a| a > UNTRUSTED_ACCURACY_M) {
        return QualityDecision::Touch;
    }

    // Reported speed says highway velocity, device says parked: GPS jump.
    if fix
        .speed_kmh()
        .is_some_and(|kmh| kmh > STATIONARY_JUMP_KMH)
        && !fix.is_moving
    {
        return QualityDecision::Reject;
    }

    if let Some(last) = last {
        let age_secs = (now - last.updated_at).num_seconds();

        // Don't let a coarse fix stomp a recent good one.
        if fix.accuracy_m.is_some_and(|a| a > POOR_ACCURACY_M)
            && last.accuracy_m.is_some_and(|a| a < GOOD_ACCURACY_M)
            && age_secs < GOOD_FIX_SHIELD_SECS
        {
            return QualityDecision::Touch;
        }

        let dist_m = geo::haversine_m(last.lat, last.lng, fix.lat, fix.lng);

        // Stationary jitter: heartbeat only.
        if !fix.is_moving {
            let jitter_m = fix.accuracy_m.unwrap_or(0.0).max(STATIONARY_JITTER_M);
            if dist_m < jitter_m {
                return QualityDecision::Touch;
            }
        }

        // Teleport detection from displacement, independent of the device's
        // own speed claim.
        if age_secs < TELEPORT_WINDOW_SECS {
            let implied_kmh = geo::implied_speed_kmh(dist_m, age_secs as f64);
            if implied_kmh > STATIONARY_JUMP_KMH && !fix.is_moving {
                return QualityDecision::Reject;
            }
        }
    }

    QualityDecision::Promote
}
