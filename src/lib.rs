//! # Route Canvas
//!
//! Turn raw GPS traces into rendered images: a smoothed route drawn over an
//! aligned basemap, optionally annotated with markers, titles and statistics,
//! and optionally restricted to a geographically clustered subset of many
//! activities.
//!
//! This library provides:
//! - Web-Mercator tile math that keeps the route pixel-aligned with the basemap
//! - Path smoothing (moving average, Gaussian, cubic smoothing spline, presets)
//! - A disk-backed tile cache with expiry
//! - Basemap assembly from prioritized tile providers with fallback
//! - Route compositing, borders, statistics panels and title overlays
//! - Greedy geographic clustering of activities into areas of interest
//!
//! ## Features
//!
//! - **`parallel`** - Smooth many activities in parallel with rayon
//!
//! ## Quick Start
//!
//! ```rust
//! use route_canvas::{GpsPoint, SmoothingPreset, smooth};
//!
//! let trace = vec![
//!     GpsPoint::new(51.5074, -0.1278),
//!     GpsPoint::new(51.5080, -0.1290),
//!     GpsPoint::new(51.5090, -0.1300),
//!     GpsPoint::new(51.5100, -0.1310),
//! ];
//!
//! let smoothed = smooth(&trace, &SmoothingPreset::Medium.resolve());
//! assert_eq!(smoothed.len(), trace.len());
//! ```

use serde::{Deserialize, Serialize};

pub mod geo_utils;
pub mod projection;
pub use projection::{
    geo_to_tile, lat_to_mercator_y, select_zoom, tile_to_geo, MapExtent, TileCoord, TILE_SIZE,
};

// Path smoothing
pub mod smoothing;
pub use smoothing::{smooth, Smoothing, SmoothingPreset, SmoothingSpec};

// Tile acquisition and basemap assembly
pub mod tile_cache;
pub use tile_cache::{CacheStats, TileCache};

pub mod tile_source;
pub use tile_source::{BasemapStyle, HttpTileProvider, TileFetchError, TileSource};

pub mod basemap;
pub use basemap::{Basemap, BasemapAssembler, BasemapConfig, BasemapView, TileGrid};

// Rendering
pub mod color;
pub mod background;
pub use background::Background;

pub mod compositor;
pub use compositor::{ActivityTrace, RenderConfig, Renderer};

pub mod annotate;
pub use annotate::{Corner, FontSource, OverlayConfig, OverlaySpec, TitleOverlay};

// Activity analysis
pub mod stats;
pub use stats::{ActivityStats, StatsPanel, Units};

pub mod clustering;
pub use clustering::{find_clusters, Cluster, ClusterConfig};

pub mod wrap;
pub use wrap::{generate_wrap, WrapRequest, WrapResult};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use route_canvas::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

impl From<[f64; 2]> for GpsPoint {
    fn from(latlng: [f64; 2]) -> Self {
        Self::new(latlng[0], latlng[1])
    }
}

/// Fraction of its own range added to each side of a bounding box before use.
pub const BOUNDS_PADDING: f64 = 0.1;

/// Smallest span (degrees) a bounding box is allowed to have on either axis.
pub const MIN_BOUNDS_SPAN: f64 = 0.001;

/// Geographic bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        Some(geo_utils::compute_bounds(points))
    }

    /// Latitude range in degrees.
    pub fn lat_span(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    /// Longitude range in degrees.
    pub fn lng_span(&self) -> f64 {
        self.max_lng - self.min_lng
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Smallest bounds containing both `self` and `other`.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
            min_lng: self.min_lng.min(other.min_lng),
            max_lng: self.max_lng.max(other.max_lng),
        }
    }

    /// Grow each side by `fraction` of the box's own range on that axis.
    pub fn padded(&self, fraction: f64) -> Bounds {
        let lat_pad = self.lat_span() * fraction;
        let lng_pad = self.lng_span() * fraction;
        Bounds {
            min_lat: self.min_lat - lat_pad,
            max_lat: self.max_lat + lat_pad,
            min_lng: self.min_lng - lng_pad,
            max_lng: self.max_lng + lng_pad,
        }
    }

    /// Widen any axis narrower than `min_span` symmetrically about its center.
    pub fn with_min_span(&self, min_span: f64) -> Bounds {
        let mut out = *self;
        if self.lat_span() < min_span {
            let mid = (self.min_lat + self.max_lat) / 2.0;
            out.min_lat = mid - min_span / 2.0;
            out.max_lat = mid + min_span / 2.0;
        }
        if self.lng_span() < min_span {
            let mid = (self.min_lng + self.max_lng) / 2.0;
            out.min_lng = mid - min_span / 2.0;
            out.max_lng = mid + min_span / 2.0;
        }
        out
    }

    /// Padded and degenerate-guarded bounds, ready for tile-grid derivation.
    pub fn prepared(&self) -> Bounds {
        self.padded(BOUNDS_PADDING).with_min_span(MIN_BOUNDS_SPAN)
    }
}

/// One recorded activity as supplied by the activity-data source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Sport type, e.g. "Run", "Ride"
    #[serde(default, rename = "type")]
    pub activity_type: String,
    /// Local start date, ISO-8601
    #[serde(default)]
    pub start_date: String,
    /// GPS samples in recording order
    #[serde(default)]
    pub points: Vec<GpsPoint>,
    /// Distance in meters
    #[serde(default)]
    pub distance: f64,
    /// Elevation gain in meters
    #[serde(default)]
    pub total_elevation_gain: f64,
    /// Moving time in seconds
    #[serde(default)]
    pub moving_time: f64,
    #[serde(default)]
    pub kudos_count: u32,
    /// Explicit line color for multi-activity renders
    #[serde(default)]
    pub color: Option<String>,
}

impl Activity {
    /// Create an activity from `[lat, lng]` pairs.
    pub fn from_latlngs(id: &str, name: &str, latlngs: &[[f64; 2]]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            points: latlngs.iter().copied().map(GpsPoint::from).collect(),
            ..Default::default()
        }
    }

    /// First recorded point, if any.
    pub fn start_point(&self) -> Option<GpsPoint> {
        self.points.first().copied()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a render request.
///
/// Recoverable conditions (a failed tile, a corrupt cache entry, a spline that
/// will not fit) never surface here; they degrade the output instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("trace has no coordinates to plot")]
    EmptyTrace,

    #[error("no activities provided")]
    NoActivities,

    #[error("cluster index {index} out of range ({count} clusters found)")]
    ClusterIndexOutOfRange { index: usize, count: usize },

    #[error("no map tiles could be loaded for {tile_count} tiles at zoom {zoom} from {provider_count} providers")]
    NoTiles {
        provider_count: usize,
        tile_count: usize,
        zoom: u8,
    },

    #[error("invalid color: {0}")]
    InvalidColor(String),

    #[error("unknown smoothing method: {0}")]
    UnknownSmoothing(String),

    #[error("font unavailable: {0}")]
    FontUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("runtime error: {0}")]
    Runtime(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_bounds_padding() {
        let bounds = Bounds { min_lat: 10.0, max_lat: 11.0, min_lng: 20.0, max_lng: 22.0 };
        let padded = bounds.padded(0.1);
        assert!((padded.min_lat - 9.9).abs() < 1e-12);
        assert!((padded.max_lat - 11.1).abs() < 1e-12);
        assert!((padded.min_lng - 19.8).abs() < 1e-12);
        assert!((padded.max_lng - 22.2).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_bounds_expanded() {
        let point = GpsPoint::new(37.77, -122.41);
        let bounds = Bounds::from_points(&[point]).unwrap().prepared();
        assert!(bounds.lat_span() >= MIN_BOUNDS_SPAN - 1e-12);
        assert!(bounds.lng_span() >= MIN_BOUNDS_SPAN - 1e-12);
        assert!((bounds.center().latitude - 37.77).abs() < 1e-9);
    }

    #[test]
    fn test_bounds_union() {
        let a = Bounds { min_lat: 1.0, max_lat: 2.0, min_lng: 1.0, max_lng: 2.0 };
        let b = Bounds { min_lat: 0.5, max_lat: 1.5, min_lng: 1.5, max_lng: 3.0 };
        let u = a.union(&b);
        assert_eq!(u, Bounds { min_lat: 0.5, max_lat: 2.0, min_lng: 1.0, max_lng: 3.0 });
    }

    #[test]
    fn test_activity_deserialize_defaults() {
        let json = r#"{"id": "42", "points": [{"latitude": 1.0, "longitude": 2.0}]}"#;
        let activity: Activity = serde_json::from_str(json).unwrap();
        assert_eq!(activity.id, "42");
        assert_eq!(activity.start_point(), Some(GpsPoint::new(1.0, 2.0)));
        assert_eq!(activity.kudos_count, 0);
        assert!(activity.color.is_none());
    }
}
