//! Pure zone math: containment per shape and flip-only transition detection.
//! The store- and cache-backed engine lives in the root crate.

use crate::geo;
use crate::model::{Geofence, GeofenceShape, ZoneTransition};

pub fn zone_contains(fence: &Geofence, lat: f64, lng: f64) -> bool {
    match &fence.shape {
        GeofenceShape::Circle {
            lat: center_lat,
            lng: center_lng,
            radius_m,
        } => geo::haversine_m(*center_lat, *center_lng, lat, lng) <= *radius_m,
        GeofenceShape::Polygon { vertices } => geo::point_in_polygon(lat, lng, vertices),
    }
}

/// A transition exists iff the membership flag flips. Same-side evaluations
/// are no-ops, which is what makes repeated fixes idempotent.
pub fn transition_for(was_inside: bool, now_inside: bool) -> Option<ZoneTransition> {
    match (was_inside, now_inside) {
        (false, true) => Some(ZoneTransition::Enter),
        (true, false) => Some(ZoneTransition::Exit),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle(radius_m: f64) -> Geofence {
        Geofence {
            id: 1,
            family_id: 1,
            name: "home".to_string(),
            shape: GeofenceShape::Circle {
                lat: 48.0,
                lng: 2.0,
                radius_m,
            },
            notify_enter: true,
            notify_exit: true,
            active: true,
        }
    }

    #[test]
    fn circle_membership_follows_the_radius() {
        let fence = circle(150.0);
        assert!(zone_contains(&fence, 48.0, 2.0));
        // ~111 m north: inside a 150 m circle, outside a 100 m one.
        assert!(zone_contains(&fence, 48.001, 2.0));
        assert!(!zone_contains(&circle(100.0), 48.001, 2.0));
    }

    #[test]
    fn polygon_membership_uses_ray_casting() {
        let fence = Geofence {
            shape: GeofenceShape::Polygon {
                vertices: vec![(47.9, 1.9), (47.9, 2.1), (48.1, 2.1), (48.1, 1.9)],
            },
            ..circle(0.0)
        };
        assert!(zone_contains(&fence, 48.0, 2.0));
        assert!(!zone_contains(&fence, 48.2, 2.0));
    }

    #[test]
    fn degenerate_polygon_never_matches() {
        let fence = Geofence {
            shape: GeofenceShape::Polygon {
                vertices: vec![(47.9, 1.9), (48.1, 2.1)],
            },
            ..circle(0.0)
        };
        assert!(!zone_contains(&fence, 48.0, 2.0));
    }

    #[test]
    fn transitions_only_on_flips() {
        assert_eq!(transition_for(false, true), Some(ZoneTransition::Enter));
        assert_eq!(transition_for(true, false), Some(ZoneTransition::Exit));
        assert_eq!(transition_for(true, true), None);
        assert_eq!(transition_for(false, false), None);
    }
}
