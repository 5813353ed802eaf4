//! Cache key namespace. Every key family the engine touches is built here so
//! the layout stays greppable and interop with other tooling keeps working.

use sha2::{Digest, Sha256};
use std::time::Duration;

pub const CURRENT_LOCATION_TTL: Duration = Duration::from_secs(300);
pub const FAMILY_SNAPSHOT_TTL: Duration = Duration::from_secs(30);
pub const SETTINGS_TTL: Duration = Duration::from_secs(3600);
pub const RATE_LIMIT_TTL: Duration = Duration::from_secs(60);
pub const DEDUPE_TTL: Duration = Duration::from_secs(300);
pub const SESSION_LIVE_TTL: Duration = Duration::from_secs(120);
pub const GEOFENCE_DEFS_TTL: Duration = Duration::from_secs(600);
pub const GEOFENCE_STATE_TTL: Duration = Duration::from_secs(3600);
pub const PLACES_TTL: Duration = Duration::from_secs(86400);
pub const DIRECTIONS_TTL: Duration = Duration::from_secs(86400);
pub const ALERT_RULES_TTL: Duration = Duration::from_secs(600);
pub const ALERT_COOLDOWN_TTL: Duration = Duration::from_secs(3600);
pub const JOB_LEASE_TTL: Duration = Duration::from_secs(90);

pub fn current_location(user_id: i64) -> String {
    format!("loc:current:{user_id}")
}

pub fn family_snapshot(family_id: i64) -> String {
    format!("loc:family:{family_id}")
}

pub fn family_settings(family_id: i64) -> String {
    format!("settings:{family_id}")
}

pub fn rate_limit(action: &str, user_id: i64) -> String {
    format!("rl:{action}:{user_id}")
}

pub fn dedupe_window(user_id: i64) -> String {
    format!("dedupe:loc:{user_id}")
}

pub fn session_live(user_id: i64) -> String {
    format!("sess:live:{user_id}")
}

pub fn geofence_defs(family_id: i64) -> String {
    format!("geo:defs:{family_id}")
}

pub fn geofence_state(fence_id: i64, user_id: i64) -> String {
    format!("geo:state:{fence_id}:{user_id}")
}

pub fn geofence_state_prefix(fence_id: i64) -> String {
    format!("geo:state:{fence_id}:")
}

pub fn place(query: &str) -> String {
    format!("places:{}", hex_digest(query.trim().to_lowercase().as_bytes()))
}

/// Directions results are keyed by a digest of both endpoints (rounded to
/// ~1 m precision) plus the routing profile, so nearby repeat lookups share an
/// entry.
pub fn directions(from: (f64, f64), to: (f64, f64), profile: &str) -> String {
    let raw = format!(
        "{:.5},{:.5}|{:.5},{:.5}|{}",
        from.0, from.1, to.0, to.1, profile
    );
    format!("route:{}", hex_digest(raw.as_bytes()))
}

pub fn alert_rules(family_id: i64) -> String {
    format!("alerts:rules:{family_id}")
}

pub fn alert_cooldown(kind: &str, user_id: i64) -> String {
    format!("alerts:cd:{kind}:{user_id}")
}

pub fn job_lease(job: &str) -> String {
    format!("jobs:lease:{job}")
}

fn hex_digest(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_families_are_distinct_per_entity() {
        assert_ne!(current_location(1), current_location(2));
        assert_ne!(rate_limit("loc", 1), rate_limit("geo", 1));
        assert_ne!(geofence_state(1, 2), geofence_state(2, 1));
    }

    #[test]
    fn directions_key_is_stable_and_profile_sensitive() {
        let a = directions((48.85837, 2.29448), (48.86047, 2.33767), "driving");
        let b = directions((48.85837, 2.29448), (48.86047, 2.33767), "driving");
        let c = directions((48.85837, 2.29448), (48.86047, 2.33767), "walking");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("route:"));
    }

    #[test]
    fn directions_key_ignores_sub_meter_jitter() {
        let a = directions((48.858370, 2.294480), (48.860470, 2.337670), "driving");
        let b = directions((48.858372, 2.294481), (48.860471, 2.337672), "driving");
        assert_eq!(a, b);
    }
}
