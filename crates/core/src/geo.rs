//! Geodesy helpers shared by the quality gate and the geofence engine.

pub const MS_TO_KMH: f64 = 3.6;
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two (lat, lng) points.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Ray-casting containment test. Degenerate polygons (fewer than three
/// vertices) never contain anything.
pub fn point_in_polygon(lat: f64, lng: f64, vertices: &[(f64, f64)]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (lat_i, lng_i) = vertices[i];
        let (lat_j, lng_j) = vertices[j];
        let crosses = (lng_i > lng) != (lng_j > lng);
        if crosses {
            let intersect_lat = (lat_j - lat_i) * (lng - lng_i) / (lng_j - lng_i) + lat_i;
            if lat < intersect_lat {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Speed in km/h implied by covering `dist_m` meters in `elapsed_secs`.
/// A positive distance in non-positive time reads as a teleport.
pub fn implied_speed_kmh(dist_m: f64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return if dist_m > 0.0 { f64::INFINITY } else { 0.0 };
    }
    dist_m / elapsed_secs * MS_TO_KMH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_for_identical_points() {
        assert_eq!(haversine_m(48.8584, 2.2945, 48.8584, 2.2945), 0.0);
    }

    #[test]
    fn haversine_matches_known_distances() {
        // One thousandth of a degree of latitude is ~111 m anywhere.
        let d = haversine_m(48.0, 2.0, 48.001, 2.0);
        assert!((d - 111.2).abs() < 1.0, "got {d}");

        // Eiffel Tower to Notre-Dame is roughly 4.1 km.
        let d = haversine_m(48.85837, 2.29448, 48.85296, 2.34988);
        assert!((3900.0..4300.0).contains(&d), "got {d}");
    }

    #[test]
    fn polygon_containment_for_a_square() {
        let square = vec![(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)];
        assert!(point_in_polygon(0.5, 0.5, &square));
        assert!(!point_in_polygon(1.5, 0.5, &square));
        assert!(!point_in_polygon(0.5, -0.1, &square));
    }

    #[test]
    fn degenerate_polygons_contain_nothing() {
        assert!(!point_in_polygon(0.0, 0.0, &[]));
        assert!(!point_in_polygon(0.0, 0.0, &[(0.0, 0.0), (1.0, 1.0)]));
    }

    #[test]
    fn implied_speed_handles_zero_elapsed() {
        assert_eq!(implied_speed_kmh(0.0, 0.0), 0.0);
        assert!(implied_speed_kmh(5.0, 0.0).is_infinite());
        // 100 m in 10 s is 36 km/h.
        assert!((implied_speed_kmh(100.0, 10.0) - 36.0).abs() < 1e-9);
    }
}
