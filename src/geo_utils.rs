//! # Geographic Utilities
//!
//! Distance and extent helpers shared by the compositor, statistics and the
//! activity clusterer.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance in meters |
//! | [`haversine_km`] | Great-circle distance in kilometers |
//! | [`polyline_length`] | Length of a trace in meters |
//! | [`compute_bounds`] | Bounding box of a trace |
//! | [`combined_bounds`] | Bounding box over several traces |
//! | [`compute_center`] | Arithmetic mean of a set of points |
//!
//! All inputs are WGS84 degrees. The haversine distance assumes a spherical
//! Earth of radius 6,371 km, which is well within the accuracy needed to
//! decide whether two activities started in the same neighbourhood.

use geo::{Distance, Haversine, Point};

use crate::{Bounds, GpsPoint};

// =============================================================================
// Distance
// =============================================================================

/// Great-circle distance between two points in meters.
///
/// ```rust
/// use route_canvas::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
/// let d = geo_utils::haversine_distance(&london, &paris);
/// assert!((d - 343_560.0).abs() < 5_000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    Haversine::distance(
        Point::new(p1.longitude, p1.latitude),
        Point::new(p2.longitude, p2.latitude),
    )
}

/// Great-circle distance between two points in kilometers.
#[inline]
pub fn haversine_km(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    haversine_distance(p1, p2) / 1000.0
}

/// Sum of segment lengths along a trace, in meters. Fewer than two points is 0.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

// =============================================================================
// Extents
// =============================================================================

/// Bounding box of a trace.
///
/// Empty input yields an inverted box (`min > max`) that [`Bounds::union`]
/// absorbs; callers that need a real box use [`Bounds::from_points`].
pub fn compute_bounds(points: &[GpsPoint]) -> Bounds {
    points.iter().fold(
        Bounds {
            min_lat: f64::MAX,
            max_lat: f64::MIN,
            min_lng: f64::MAX,
            max_lng: f64::MIN,
        },
        |b, p| Bounds {
            min_lat: b.min_lat.min(p.latitude),
            max_lat: b.max_lat.max(p.latitude),
            min_lng: b.min_lng.min(p.longitude),
            max_lng: b.max_lng.max(p.longitude),
        },
    )
}

/// Bounding box over every point of every trace; `None` when all are empty.
pub fn combined_bounds<'a, I>(traces: I) -> Option<Bounds>
where
    I: IntoIterator<Item = &'a [GpsPoint]>,
{
    traces
        .into_iter()
        .filter(|t| !t.is_empty())
        .map(compute_bounds)
        .reduce(|a, b| a.union(&b))
}

/// Arithmetic mean of the points. Returns (0, 0) for empty input.
///
/// Fine for the small areas clusters cover; not meaningful across the
/// antimeridian.
pub fn compute_center(points: &[GpsPoint]) -> GpsPoint {
    if points.is_empty() {
        return GpsPoint::new(0.0, 0.0);
    }
    let n = points.len() as f64;
    let (lat, lng) = points
        .iter()
        .fold((0.0, 0.0), |(lat, lng), p| (lat + p.latitude, lng + p.longitude));
    GpsPoint::new(lat / n, lng / n)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_same_point() {
        let p = GpsPoint::new(37.77, -122.41);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_haversine_km_one_degree_latitude() {
        let a = GpsPoint::new(0.0, 10.0);
        let b = GpsPoint::new(1.0, 10.0);
        assert!(approx_eq(haversine_km(&a, &b), 111.19, 0.1));
    }

    #[test]
    fn test_polyline_length_short_inputs() {
        assert_eq!(polyline_length(&[]), 0.0);
        assert_eq!(polyline_length(&[GpsPoint::new(1.0, 1.0)]), 0.0);
    }

    #[test]
    fn test_polyline_length_sums_segments() {
        let a = GpsPoint::new(0.0, 0.0);
        let b = GpsPoint::new(0.0, 0.01);
        let c = GpsPoint::new(0.01, 0.01);
        let total = polyline_length(&[a, b, c]);
        let expected = haversine_distance(&a, &b) + haversine_distance(&b, &c);
        assert!(approx_eq(total, expected, 1e-9));
    }

    #[test]
    fn test_compute_bounds() {
        let track = vec![
            GpsPoint::new(37.77, -122.42),
            GpsPoint::new(37.80, -122.27),
            GpsPoint::new(37.75, -122.30),
        ];
        let bounds = compute_bounds(&track);
        assert_eq!(bounds.min_lat, 37.75);
        assert_eq!(bounds.max_lat, 37.80);
        assert_eq!(bounds.min_lng, -122.42);
        assert_eq!(bounds.max_lng, -122.27);
    }

    #[test]
    fn test_combined_bounds_skips_empty() {
        let a = vec![GpsPoint::new(1.0, 1.0), GpsPoint::new(2.0, 2.0)];
        let empty: Vec<GpsPoint> = vec![];
        let b = vec![GpsPoint::new(-1.0, 3.0)];
        let bounds =
            combined_bounds([a.as_slice(), empty.as_slice(), b.as_slice()]).unwrap();
        assert_eq!(bounds.min_lat, -1.0);
        assert_eq!(bounds.max_lat, 2.0);
        assert_eq!(bounds.min_lng, 1.0);
        assert_eq!(bounds.max_lng, 3.0);

        assert!(combined_bounds([empty.as_slice()]).is_none());
    }

    #[test]
    fn test_compute_center() {
        let center = compute_center(&[GpsPoint::new(10.0, 20.0), GpsPoint::new(12.0, 24.0)]);
        assert!(approx_eq(center.latitude, 11.0, 1e-12));
        assert!(approx_eq(center.longitude, 22.0, 1e-12));
        assert_eq!(compute_center(&[]), GpsPoint::new(0.0, 0.0));
    }
}
