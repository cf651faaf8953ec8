//! # Web-Mercator Projection
//!
//! Conversions between geographic coordinates, slippy-map tile indices and
//! normalized Mercator Y.
//!
//! The stitched basemap raster is linear in longitude and in Mercator Y, not in
//! latitude. Anything drawn on top of a basemap must therefore be positioned
//! with [`lat_to_mercator_y`] against the extent returned by the assembler
//! (see [`MapExtent`]), which keeps route and tiles pixel-aligned at every zoom.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`geo_to_tile`] | Tile containing a point at a zoom level |
//! | [`tile_to_geo`] | North-west corner of a tile |
//! | [`lat_to_mercator_y`] | Normalized Mercator Y in `[0, 1]`, increasing southward |
//! | [`select_zoom`] | Zoom level for a bounding-box span |

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{Bounds, GpsPoint};

/// Standard raster tile edge length in pixels.
pub const TILE_SIZE: u32 = 256;

/// Practical latitude limit of the Web-Mercator projection.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

/// Guards tile flooring against round-trip error at exact tile edges.
const TILE_EDGE_EPSILON: f64 = 1e-9;

/// Span thresholds (degrees) mapped to zoom levels, checked in order.
const ZOOM_THRESHOLDS: [(f64, u8); 6] = [
    (1.0, 10),
    (0.5, 11),
    (0.1, 12),
    (0.05, 13),
    (0.01, 14),
    (0.005, 15),
];

/// Zoom used when the span is below every threshold.
const MAX_AUTO_ZOOM: u8 = 16;

/// A slippy-map tile index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// Create a tile coordinate, clamping `x` and `y` into `[0, 2^zoom)`.
    pub fn new(zoom: u8, x: i64, y: i64) -> Self {
        let max_index = tiles_per_axis(zoom) as i64 - 1;
        Self {
            zoom,
            x: x.clamp(0, max_index) as u32,
            y: y.clamp(0, max_index) as u32,
        }
    }
}

/// Number of tiles along one axis at `zoom`.
#[inline]
pub fn tiles_per_axis(zoom: u8) -> u32 {
    1u32 << zoom.min(31)
}

/// Clamp a latitude into the valid Mercator range.
#[inline]
pub fn clamp_latitude(lat: f64) -> f64 {
    lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT)
}

/// Normalized Mercator Y for a latitude: 0 at the northern limit, 1 at the
/// southern limit.
#[inline]
pub fn lat_to_mercator_y(lat: f64) -> f64 {
    let lat_rad = lat.to_radians();
    (1.0 - lat_rad.tan().asinh() / PI) / 2.0
}

/// Inverse of [`lat_to_mercator_y`].
#[inline]
pub fn mercator_y_to_lat(y: f64) -> f64 {
    (PI * (1.0 - 2.0 * y)).sinh().atan().to_degrees()
}

/// Normalized Mercator X for a longitude: 0 at -180°, 1 at +180°.
#[inline]
pub fn lon_to_mercator_x(lon: f64) -> f64 {
    (lon + 180.0) / 360.0
}

/// Fractional tile X for a longitude.
#[inline]
pub fn lon_to_tile_x(lon: f64, zoom: u8) -> f64 {
    lon_to_mercator_x(lon) * tiles_per_axis(zoom) as f64
}

/// Fractional tile Y for a latitude.
#[inline]
pub fn lat_to_tile_y(lat: f64, zoom: u8) -> f64 {
    lat_to_mercator_y(lat) * tiles_per_axis(zoom) as f64
}

/// Tile containing `(lat, lon)` at `zoom`.
pub fn geo_to_tile(lat: f64, lon: f64, zoom: u8) -> TileCoord {
    let x = (lon_to_tile_x(lon, zoom) + TILE_EDGE_EPSILON).floor() as i64;
    let y = (lat_to_tile_y(clamp_latitude(lat), zoom) + TILE_EDGE_EPSILON).floor() as i64;
    TileCoord::new(zoom, x, y)
}

/// North-west corner of tile `(x, y)` at `zoom`.
///
/// `x` and `y` may equal `2^zoom` to address the far edge of the last tile.
pub fn tile_to_geo(x: u32, y: u32, zoom: u8) -> GpsPoint {
    let n = tiles_per_axis(zoom) as f64;
    let lon = x as f64 / n * 360.0 - 180.0;
    let lat = mercator_y_to_lat(y as f64 / n);
    GpsPoint::new(lat, lon)
}

/// Geographic bounds covered by one tile.
pub fn tile_bounds(coord: TileCoord) -> Bounds {
    let nw = tile_to_geo(coord.x, coord.y, coord.zoom);
    let se = tile_to_geo(coord.x + 1, coord.y + 1, coord.zoom);
    Bounds {
        min_lat: se.latitude,
        max_lat: nw.latitude,
        min_lng: nw.longitude,
        max_lng: se.longitude,
    }
}

/// Pick a zoom level from the larger of the latitude and longitude spans.
///
/// Larger spans never produce a higher zoom than smaller spans.
pub fn select_zoom(lat_span: f64, lon_span: f64) -> u8 {
    let span = lat_span.max(lon_span);
    ZOOM_THRESHOLDS
        .iter()
        .find(|(threshold, _)| span > *threshold)
        .map(|(_, zoom)| *zoom)
        .unwrap_or(MAX_AUTO_ZOOM)
}

/// Zoom level for a bounding box, see [`select_zoom`].
pub fn zoom_for_bounds(bounds: &Bounds) -> u8 {
    select_zoom(bounds.lat_span(), bounds.lng_span())
}

// =============================================================================
// Map Extent
// =============================================================================

/// The true geographic extent of a raster, in both lat/lon and Mercator-Y form.
///
/// Basemaps cover whole tiles, so this is generally larger than the bounding
/// box that was requested. Always place overlays against this extent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapExtent {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
    /// Mercator Y of the northern edge (`max_lat`)
    pub top_y: f64,
    /// Mercator Y of the southern edge (`min_lat`)
    pub bottom_y: f64,
}

impl MapExtent {
    /// Extent of a geographic bounding box.
    pub fn from_bounds(bounds: &Bounds) -> Self {
        let max_lat = clamp_latitude(bounds.max_lat);
        let min_lat = clamp_latitude(bounds.min_lat);
        Self {
            min_lat,
            max_lat,
            min_lng: bounds.min_lng,
            max_lng: bounds.max_lng,
            top_y: lat_to_mercator_y(max_lat),
            bottom_y: lat_to_mercator_y(min_lat),
        }
    }

    /// Extent spanned by a rectangle given in normalized Mercator coordinates.
    pub fn from_mercator(left_x: f64, right_x: f64, top_y: f64, bottom_y: f64) -> Self {
        Self {
            min_lat: mercator_y_to_lat(bottom_y),
            max_lat: mercator_y_to_lat(top_y),
            min_lng: left_x * 360.0 - 180.0,
            max_lng: right_x * 360.0 - 180.0,
            top_y,
            bottom_y,
        }
    }

    /// Width over height of the extent in Mercator space.
    pub fn mercator_aspect(&self) -> f64 {
        let width = lon_to_mercator_x(self.max_lng) - lon_to_mercator_x(self.min_lng);
        let height = self.bottom_y - self.top_y;
        if height <= 0.0 {
            return 1.0;
        }
        width / height
    }

    /// Project a GPS point onto a `width x height` raster covering this extent.
    ///
    /// X is linear in longitude and Y is linear in Mercator Y.
    pub fn project(&self, point: &GpsPoint, width: u32, height: u32) -> (f32, f32) {
        let lng_span = self.max_lng - self.min_lng;
        let y_span = self.bottom_y - self.top_y;

        let fx = if lng_span.abs() > f64::EPSILON {
            (point.longitude - self.min_lng) / lng_span
        } else {
            0.5
        };
        let fy = if y_span.abs() > f64::EPSILON {
            (lat_to_mercator_y(clamp_latitude(point.latitude)) - self.top_y) / y_span
        } else {
            0.5
        };

        ((fx * width as f64) as f32, (fy * height as f64) as f32)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
