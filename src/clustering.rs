//! # Activity Clustering
//!
//! Groups activities into areas of interest by their start points.
//!
//! ## Algorithm
//!
//! A single greedy pass in input order:
//!
//! 1. For the next unassigned activity, collect every unassigned activity
//!    (itself included) whose start point lies within `radius_km`.
//! 2. If that neighbourhood has at least `min_activities` members it becomes
//!    a cluster and all of its members are assigned.
//! 3. Clusters are returned largest first.
//!
//! Assignment is order dependent: the first activity whose neighbourhood is
//! dense enough claims all of it, so reordering equally dense regions can
//! change the result. Set [`ClusterConfig::sort_by_id`] for an order-free
//! result.
//!
//! An R-tree over start points narrows each neighbourhood query to a
//! bounding box; the haversine distance is the exact test.

use std::collections::HashSet;

use log::{debug, info};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{compute_center, haversine_km};
use crate::{Activity, GpsPoint};

/// Mean earth radius used to size R-tree search boxes, in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Configuration for [`find_clusters`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Start points within this great-circle distance are neighbours.
    /// Default: 5.0
    pub radius_km: f64,

    /// Smallest neighbourhood that forms a cluster. `None` means a third of
    /// the activities, and at least 2.
    /// Default: None
    pub min_activities: Option<usize>,

    /// Visit activities in id order instead of input order.
    /// Default: false
    pub sort_by_id: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            radius_km: 5.0,
            min_activities: None,
            sort_by_id: false,
        }
    }
}

impl ClusterConfig {
    pub fn with_radius(radius_km: f64) -> Self {
        Self {
            radius_km,
            ..Default::default()
        }
    }

    /// Threshold used for `activity_count` activities.
    pub fn min_for(&self, activity_count: usize) -> usize {
        self.min_activities
            .unwrap_or_else(|| (activity_count / 3).max(2))
    }
}

/// An area of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Mean of the members' start points
    pub center: GpsPoint,
    /// Indices into the clustered slice, in input order
    pub members: Vec<usize>,
    /// Ids of the members, parallel to `members`
    pub activity_ids: Vec<String>,
    pub radius_km: f64,
}

impl Cluster {
    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, activity_id: &str) -> bool {
        self.activity_ids.iter().any(|id| id == activity_id)
    }
}

// ============================================================================
// Spatial Index
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct StartPoint {
    idx: usize,
    lat: f64,
    lng: f64,
}

impl RTreeObject for StartPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lat, self.lng])
    }
}

/// Box around `center` containing every point within `radius_km`, or `None`
/// when the circle reaches a pole or the antimeridian.
fn search_envelope(center: &GpsPoint, radius_km: f64) -> Option<AABB<[f64; 2]>> {
    let angle = radius_km / EARTH_RADIUS_KM;
    let dlat = angle.to_degrees() * 1.001 + 1e-9;
    if center.latitude.abs() + dlat >= 90.0 {
        return None;
    }
    let ratio = angle.sin() / center.latitude.to_radians().cos();
    if ratio >= 1.0 {
        return None;
    }
    let dlng = ratio.asin().to_degrees() * 1.001 + 1e-9;
    if center.longitude - dlng < -180.0 || center.longitude + dlng > 180.0 {
        return None;
    }
    Some(AABB::from_corners(
        [center.latitude - dlat, center.longitude - dlng],
        [center.latitude + dlat, center.longitude + dlng],
    ))
}

// ============================================================================
// Clustering
// ============================================================================

/// Greedy single-pass clustering of activities by start point.
///
/// Activities without GPS points are never clustered. Every activity is in
/// at most one cluster.
///
/// # Example
/// ```
/// use route_canvas::{Activity, ClusterConfig, find_clusters};
///
/// let activities = vec![
///     Activity::from_latlngs("a", "Run 1", &[[37.7749, -122.4194]]),
///     Activity::from_latlngs("b", "Run 2", &[[37.7759, -122.4184]]),
///     Activity::from_latlngs("c", "Far away", &[[37.3382, -121.8863]]),
/// ];
/// let clusters = find_clusters(&activities, &ClusterConfig::with_radius(5.0));
/// assert_eq!(clusters.len(), 1);
/// assert_eq!(clusters[0].activity_ids, vec!["a", "b"]);
/// ```
pub fn find_clusters(activities: &[Activity], config: &ClusterConfig) -> Vec<Cluster> {
    if activities.is_empty() {
        return Vec::new();
    }
    let min_activities = config.min_for(activities.len());

    let mut order: Vec<usize> = (0..activities.len())
        .filter(|&i| activities[i].start_point().is_some())
        .collect();
    if config.sort_by_id {
        order.sort_by(|&a, &b| activities[a].id.cmp(&activities[b].id));
    }
    // Rank of each activity in visiting order, so members can be listed in it.
    let mut rank = vec![usize::MAX; activities.len()];
    for (r, &i) in order.iter().enumerate() {
        rank[i] = r;
    }

    let starts: Vec<StartPoint> = order
        .iter()
        .filter_map(|&idx| {
            activities[idx].start_point().map(|p| StartPoint {
                idx,
                lat: p.latitude,
                lng: p.longitude,
            })
        })
        .collect();
    let tree = RTree::bulk_load(starts.clone());

    debug!(
        "[Clusterer] {} activities with start points, radius {} km, min {}",
        starts.len(),
        config.radius_km,
        min_activities
    );

    let mut assigned = vec![false; activities.len()];
    let mut clusters = Vec::new();

    for seed in &starts {
        if assigned[seed.idx] {
            continue;
        }
        let center = GpsPoint::new(seed.lat, seed.lng);
        let candidates: Vec<StartPoint> = match search_envelope(&center, config.radius_km) {
            Some(envelope) => tree.locate_in_envelope_intersecting(&envelope).copied().collect(),
            None => starts.clone(),
        };

        let mut members: Vec<StartPoint> = candidates
            .into_iter()
            .filter(|c| !assigned[c.idx])
            .filter(|c| haversine_km(&center, &GpsPoint::new(c.lat, c.lng)) <= config.radius_km)
            .collect();
        if members.len() < min_activities {
            continue;
        }
        members.sort_by_key(|m| rank[m.idx]);

        let member_points: Vec<GpsPoint> = members.iter().map(|m| GpsPoint::new(m.lat, m.lng)).collect();
        let cluster_center = compute_center(&member_points);
        for m in &members {
            assigned[m.idx] = true;
        }
        debug!(
            "[Clusterer] Cluster of {} at ({:.6}, {:.6})",
            members.len(),
            cluster_center.latitude,
            cluster_center.longitude
        );
        clusters.push(Cluster {
            center: cluster_center,
            activity_ids: members.iter().map(|m| activities[m.idx].id.clone()).collect(),
            members: members.iter().map(|m| m.idx).collect(),
            radius_km: config.radius_km,
        });
    }

    clusters.sort_by(|a, b| b.count().cmp(&a.count()));
    info!(
        "[Clusterer] {} clusters, {}/{} activities clustered",
        clusters.len(),
        assigned.iter().filter(|a| **a).count(),
        starts.len()
    );
    clusters
}

/// The biggest cluster with at least two members.
pub fn largest_cluster(activities: &[Activity], radius_km: f64) -> Option<Cluster> {
    let config = ClusterConfig {
        radius_km,
        min_activities: Some(2),
        sort_by_id: false,
    };
    find_clusters(activities, &config).into_iter().next()
}

/// Activities belonging to `cluster`, in their original order.
pub fn filter_by_cluster(activities: &[Activity], cluster: &Cluster) -> Vec<Activity> {
    let ids: HashSet<&str> = cluster.activity_ids.iter().map(String::as_str).collect();
    activities
        .iter()
        .filter(|a| ids.contains(a.id.as_str()))
        .cloned()
        .collect()
}

/// Activities whose start point is within `radius_km` of `center`, inclusive.
pub fn filter_by_location(activities: &[Activity], center: &GpsPoint, radius_km: f64) -> Vec<Activity> {
    let kept: Vec<Activity> = activities
        .iter()
        .filter(|a| {
            a.start_point()
                .map(|p| haversine_km(center, &p) <= radius_km)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    debug!(
        "[Clusterer] {}/{} activities start within {} km of ({:.4}, {:.4})",
        kept.len(),
        activities.len(),
        radius_km,
        center.latitude,
        center.longitude
    );
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(id: &str, lat: f64, lng: f64) -> Activity {
        Activity::from_latlngs(id, id, &[[lat, lng]])
    }

    fn bay_area() -> Vec<Activity> {
        vec![
            at("sf1", 37.7749, -122.4194),
            at("sf2", 37.7759, -122.4184),
            at("sf3", 37.7739, -122.4204),
            at("oak1", 37.8044, -122.2708),
            at("sf4", 37.7754, -122.4189),
            at("oak2", 37.8054, -122.2718),
            at("sf5", 37.7744, -122.4199),
            at("oak3", 37.8034, -122.2698),
            at("sj", 37.3382, -121.8863),
        ]
    }

    #[test]
    fn test_default_min_activities() {
        let config = ClusterConfig::default();
        assert_eq!(config.min_for(0), 2);
        assert_eq!(config.min_for(5), 2);
        assert_eq!(config.min_for(9), 3);
        assert_eq!(config.min_for(120), 40);
        let fixed = ClusterConfig { min_activities: Some(7), ..Default::default() };
        assert_eq!(fixed.min_for(120), 7);
    }

    #[test]
    fn test_bay_area_clusters() {
        let clusters = find_clusters(&bay_area(), &ClusterConfig::default());
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].activity_ids, vec!["sf1", "sf2", "sf3", "sf4", "sf5"]);
        assert_eq!(clusters[0].members, vec![0, 1, 2, 4, 6]);
        assert_eq!(clusters[1].activity_ids, vec!["oak1", "oak2", "oak3"]);
        assert!((clusters[0].center.latitude - 37.7749).abs() < 1e-9);
        assert!((clusters[0].center.longitude + 122.4194).abs() < 1e-9);
        assert!(!clusters.iter().any(|c| c.contains("sj")));
        assert_eq!(clusters[0].radius_km, 5.0);
    }

    #[test]
    fn test_no_double_assignment() {
        // Three points 4 km apart on a line: the first claims the middle one.
        let line = vec![at("a", 0.0, 0.0), at("b", 0.0, 0.036), at("c", 0.0, 0.072)];
        let config = ClusterConfig { radius_km: 4.5, min_activities: Some(2), sort_by_id: false };
        let clusters = find_clusters(&line, &config);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].activity_ids, vec!["a", "b"]);

        let mut seen = HashSet::new();
        for c in find_clusters(&bay_area(), &ClusterConfig { min_activities: Some(1), ..Default::default() }) {
            for m in c.members {
                assert!(seen.insert(m));
            }
        }
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_order_dependence_and_sort_by_id() {
        let mut line = vec![at("b", 0.0, 0.036), at("c", 0.0, 0.072), at("a", 0.0, 0.0)];
        let config = ClusterConfig { radius_km: 4.5, min_activities: Some(2), sort_by_id: false };
        // "b" is visited first and reaches both neighbours.
        let clusters = find_clusters(&line, &config);
        assert_eq!(clusters[0].activity_ids, vec!["b", "c", "a"]);

        let by_id = ClusterConfig { sort_by_id: true, ..config.clone() };
        let clusters = find_clusters(&line, &by_id);
        assert_eq!(clusters[0].activity_ids, vec!["a", "b"]);

        line.reverse();
        assert_eq!(find_clusters(&line, &by_id)[0].activity_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_reclustering_a_cluster_is_idempotent() {
        let activities = bay_area();
        let clusters = find_clusters(&activities, &ClusterConfig::default());
        let members = filter_by_cluster(&activities, &clusters[0]);
        let again = find_clusters(
            &members,
            &ClusterConfig { radius_km: 5.0, min_activities: Some(1), sort_by_id: false },
        );
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].activity_ids, clusters[0].activity_ids);
    }

    #[test]
    fn test_activities_without_points_are_skipped() {
        let mut activities = bay_area();
        activities.insert(0, Activity { id: "indoor".into(), ..Default::default() });
        let clusters = find_clusters(&activities, &ClusterConfig::default());
        assert!(clusters.iter().all(|c| !c.contains("indoor")));
        assert_eq!(clusters[0].members, vec![1, 2, 3, 5, 7]);
    }

    #[test]
    fn test_empty_input() {
        assert!(find_clusters(&[], &ClusterConfig::default()).is_empty());
        assert!(largest_cluster(&[], 5.0).is_none());
    }

    #[test]
    fn test_largest_cluster() {
        let largest = largest_cluster(&bay_area(), 5.0).unwrap();
        assert_eq!(largest.count(), 5);
    }

    #[test]
    fn test_filter_by_location_is_inclusive() {
        let activities = bay_area();
        let sf = GpsPoint::new(37.7749, -122.4194);
        let near = filter_by_location(&activities, &sf, 1.0);
        assert_eq!(near.len(), 5);

        let exact = haversine_km(&sf, &GpsPoint::new(37.8044, -122.2708));
        let with_oakland = filter_by_location(&activities, &sf, exact);
        assert!(with_oakland.iter().any(|a| a.id == "oak1"));
    }

    #[test]
    fn test_search_envelope_contains_circle() {
        for &lat in &[0.0, 37.77, 60.0, -75.0] {
            let center = GpsPoint::new(lat, 10.0);
            let radius = 25.0;
            let envelope = search_envelope(&center, radius).unwrap();
            for step in 0..72 {
                let bearing = (step as f64 * 5.0).to_radians();
                let p = destination(&center, bearing, radius * 0.9999);
                assert!(haversine_km(&center, &p) <= radius);
                let lower = envelope.lower();
                let upper = envelope.upper();
                assert!(p.latitude >= lower[0] && p.latitude <= upper[0], "lat {} at {}", p.latitude, lat);
                assert!(p.longitude >= lower[1] && p.longitude <= upper[1], "lng {} at {}", p.longitude, lat);
            }
        }
    }

    #[test]
    fn test_search_envelope_falls_back_near_edges() {
        assert!(search_envelope(&GpsPoint::new(89.99, 0.0), 5.0).is_none());
        assert!(search_envelope(&GpsPoint::new(0.0, 179.99), 5.0).is_none());

        let across = vec![at("w", 0.0, 179.99), at("e", 0.0, -179.99)];
        let config = ClusterConfig { radius_km: 5.0, min_activities: Some(2), sort_by_id: false };
        assert_eq!(find_clusters(&across, &config).len(), 1);
    }

    /// Point `distance_km` from `start` along `bearing`.
    fn destination(start: &GpsPoint, bearing: f64, distance_km: f64) -> GpsPoint {
        let d = distance_km / EARTH_RADIUS_KM;
        let lat1 = start.latitude.to_radians();
        let lng1 = start.longitude.to_radians();
        let lat2 = (lat1.sin() * d.cos() + lat1.cos() * d.sin() * bearing.cos()).asin();
        let lng2 = lng1 + (bearing.sin() * d.sin() * lat1.cos()).atan2(d.cos() - lat1.sin() * lat2.sin());
        GpsPoint::new(lat2.to_degrees(), lng2.to_degrees())
    }
}
