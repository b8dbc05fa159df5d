//! Great-circle distance and travel time estimates

use crate::types::GeoPoint;

/// Mean Earth radius used by the haversine formula, in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two points in kilometres
///
/// Symmetric in its arguments and exactly zero for identical points.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    if a == b {
        return 0.0;
    }

    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    // Clamp guards asin against rounding just above 1.0 for antipodal points
    let c = 2.0 * h.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * c
}

/// Advisory travel time in minutes at the given average speed
pub fn eta_minutes(distance_km: f64, average_speed_kmh: f64) -> f64 {
    if average_speed_kmh <= 0.0 {
        return f64::INFINITY;
    }
    distance_km / average_speed_kmh * 60.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn point() -> impl Strategy<Value = GeoPoint> {
        (-90.0f64..=90.0, -180.0f64..=180.0).prop_map(|(lat, lng)| GeoPoint::new(lat, lng))
    }

    #[test]
    fn test_known_distance() {
        // One degree of latitude is ~111.19 km on a 6371 km sphere
        let d = haversine_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!((d - 111.19).abs() < 0.01, "got {}", d);
    }

    #[test]
    fn test_antipodal_distance() {
        let d = haversine_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 180.0));
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1e-6);
    }

    #[test]
    fn test_eta_minutes() {
        assert_eq!(eta_minutes(15.0, 30.0), 30.0);
        assert_eq!(eta_minutes(0.0, 30.0), 0.0);
        assert!(eta_minutes(5.0, 0.0).is_infinite());
    }

    proptest! {
        #[test]
        fn prop_symmetric(a in point(), b in point()) {
            let ab = haversine_km(a, b);
            let ba = haversine_km(b, a);
            prop_assert!((ab - ba).abs() < 1e-9);
        }

        #[test]
        fn prop_zero_for_identical_points(a in point()) {
            prop_assert_eq!(haversine_km(a, a), 0.0);
        }

        #[test]
        fn prop_bounded_by_half_circumference(a in point(), b in point()) {
            let d = haversine_km(a, b);
            prop_assert!(d >= 0.0);
            prop_assert!(d <= std::f64::consts::PI * EARTH_RADIUS_KM + 1e-6);
        }

        #[test]
        fn prop_monotonic_in_latitude(
            lat in -80.0f64..0.0,
            lng in -180.0f64..=180.0,
            step in 0.01f64..5.0,
            extra in 0.01f64..5.0,
        ) {
            let origin = GeoPoint::new(lat, lng);
            let near = GeoPoint::new(lat + step, lng);
            let far = GeoPoint::new(lat + step + extra, lng);
            prop_assert!(haversine_km(origin, near) < haversine_km(origin, far));
        }
    }
}
