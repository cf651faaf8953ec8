//! # Basemap Assembly
//!
//! Builds one raster basemap for a bounding box from slippy-map tiles.
//!
//! ## Pipeline
//!
//! 1. Pick a zoom: from the padded bounding box's span, or an explicit zoom.
//! 2. Cover the box with a [`TileGrid`] (at least 1x1). Without an explicit
//!    zoom the grid is widened toward the canvas aspect ratio.
//! 3. Fetch every tile, cache first, from the first provider of the chain that
//!    yields at least one tile. That provider is used for the whole grid.
//! 4. Stitch at native resolution, apply the tone adjustment, resize.
//! 5. Return the raster with the grid's true [`MapExtent`]. Overlays must be
//!    positioned against that extent, not the requested box.
//!
//! Zero tiles from every provider is the only failure ([`Error::NoTiles`]);
//! individual missing tiles are left as canvas colour.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::color::ToneAdjustment;
use crate::projection::{
    geo_to_tile, lat_to_mercator_y, lon_to_mercator_x, tiles_per_axis, zoom_for_bounds,
    MapExtent, TileCoord, TILE_SIZE,
};
use crate::tile_cache::TileCache;
use crate::tile_source::{first_success, BasemapStyle, TileSource};
use crate::{Bounds, Error, Result, MIN_BOUNDS_SPAN};

/// Grids are only widened when their aspect differs from the canvas by more
/// than this.
const ASPECT_TOLERANCE: f64 = 0.1;

/// Aspect ratio limits for canvases and planned grids. The range is
/// symmetric, so it bounds both width/height and height/width.
pub(crate) const MIN_ASPECT: f64 = 0.25;
pub(crate) const MAX_ASPECT: f64 = 4.0;

/// Colour of any tile that could not be fetched.
const CANVAS_FILL: Rgba<u8> = Rgba([250, 250, 250, 255]);

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for basemap assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasemapConfig {
    /// Provider chain to fetch from when no explicit sources are supplied.
    /// Default: minimal
    pub style: BasemapStyle,

    /// Tone applied to the stitched raster before resizing.
    /// Default: saturation 0.15, brightness 1.0, contrast 0.85
    pub tone: ToneAdjustment,

    /// Maximum tile fetches in flight.
    /// Default: 8
    pub max_concurrent: usize,
}

impl Default for BasemapConfig {
    fn default() -> Self {
        Self {
            style: BasemapStyle::Minimal,
            tone: ToneAdjustment::MINIMAL_BASEMAP,
            max_concurrent: 8,
        }
    }
}

/// What area a basemap should show.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BasemapView {
    /// Fit a bounding box: pad it, pick the zoom, match the canvas aspect.
    Fit { bounds: Bounds },
    /// Reproduce exactly this box at this zoom, cropping the stitched tiles.
    Exact { bounds: Bounds, zoom: u8 },
}

// ============================================================================
// Tile Grid
// ============================================================================

/// Inclusive rectangle of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGrid {
    pub zoom: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileGrid {
    /// Smallest grid containing `bounds`.
    pub fn covering(bounds: &Bounds, zoom: u8) -> Self {
        let nw = geo_to_tile(bounds.max_lat, bounds.min_lng, zoom);
        let se = geo_to_tile(bounds.min_lat, bounds.max_lng, zoom);
        Self {
            zoom,
            min_x: nw.x.min(se.x),
            max_x: nw.x.max(se.x),
            min_y: nw.y.min(se.y),
            max_y: nw.y.max(se.y),
        }
    }

    pub fn tiles_wide(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn tiles_high(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    pub fn tile_count(&self) -> usize {
        self.tiles_wide() as usize * self.tiles_high() as usize
    }

    /// Stitched raster size at native tile resolution.
    pub fn pixel_size(&self) -> (u32, u32) {
        (self.tiles_wide() * TILE_SIZE, self.tiles_high() * TILE_SIZE)
    }

    /// Widen the grid along one axis so its aspect ratio approaches
    /// `target_aspect` (width / height). The zoom never changes and the grid
    /// only ever grows by the tiles the aspect calls for.
    pub fn expanded_to_aspect(&self, target_aspect: f64) -> Self {
        if !target_aspect.is_finite() || target_aspect <= 0.0 {
            return *self;
        }
        let wide = self.tiles_wide() as f64;
        let high = self.tiles_high() as f64;
        let current = wide / high;
        if (current - target_aspect).abs() <= ASPECT_TOLERANCE {
            return *self;
        }

        let limit = tiles_per_axis(self.zoom);
        let mut grid = *self;
        if target_aspect > current {
            let needed = (high * target_aspect) as u32;
            let (min, max) = spread(self.min_x, self.max_x, needed.saturating_sub(self.tiles_wide()), limit);
            grid.min_x = min;
            grid.max_x = max;
        } else {
            let needed = (wide / target_aspect) as u32;
            let (min, max) = spread(self.min_y, self.max_y, needed.saturating_sub(self.tiles_high()), limit);
            grid.min_y = min;
            grid.max_y = max;
        }
        grid
    }

    /// Every tile in row-major order.
    pub fn tiles(&self) -> Vec<TileCoord> {
        (self.min_y..=self.max_y)
            .flat_map(|y| {
                (self.min_x..=self.max_x).map(move |x| TileCoord {
                    zoom: self.zoom,
                    x,
                    y,
                })
            })
            .collect()
    }

    /// Geographic extent of the whole grid.
    pub fn extent(&self) -> MapExtent {
        let n = tiles_per_axis(self.zoom) as f64;
        MapExtent::from_mercator(
            self.min_x as f64 / n,
            (self.max_x + 1) as f64 / n,
            self.min_y as f64 / n,
            (self.max_y + 1) as f64 / n,
        )
    }
}

/// Add `expand` tiles around `[min, max]`, half after and the rest before,
/// then slide the window back inside `[0, limit)`.
fn spread(min: u32, max: u32, expand: u32, limit: u32) -> (u32, u32) {
    if expand == 0 {
        return (min, max);
    }
    let width = (max - min + 1 + expand).min(limit) as i64;
    let mut lo = min as i64 - (expand - expand / 2) as i64;
    if lo < 0 {
        lo = 0;
    }
    if lo + width > limit as i64 {
        lo = limit as i64 - width;
    }
    (lo as u32, (lo + width - 1) as u32)
}

// ============================================================================
// Result
// ============================================================================

/// An assembled basemap.
#[derive(Debug, Clone)]
pub struct Basemap {
    /// Raster at the requested canvas size
    pub image: RgbaImage,
    /// What the raster actually covers
    pub extent: MapExtent,
    pub grid: TileGrid,
    /// Name of the provider the tiles came from
    pub provider: String,
    pub tiles_from_cache: usize,
    pub tiles_downloaded: usize,
}

impl Basemap {
    pub fn zoom(&self) -> u8 {
        self.grid.zoom
    }
}

struct FetchedTile {
    coord: TileCoord,
    image: RgbaImage,
    from_cache: bool,
}

// ============================================================================
// Assembler
// ============================================================================

enum SourceSelection {
    ByStyle(Client),
    Fixed(Vec<Arc<dyn TileSource>>),
}

/// Assembles basemaps through a tile cache and a provider chain.
pub struct BasemapAssembler {
    cache: TileCache,
    sources: SourceSelection,
    config: BasemapConfig,
}

impl BasemapAssembler {
    /// Fetch from the HTTP providers of `config.style`.
    pub fn new(cache: TileCache, client: Client) -> Self {
        Self {
            cache,
            sources: SourceSelection::ByStyle(client),
            config: BasemapConfig::default(),
        }
    }

    /// Fetch from an explicit provider chain, primary first. `config.style`
    /// is ignored.
    pub fn with_sources(cache: TileCache, sources: Vec<Arc<dyn TileSource>>) -> Self {
        Self {
            cache,
            sources: SourceSelection::Fixed(sources),
            config: BasemapConfig::default(),
        }
    }

    pub fn with_config(mut self, config: BasemapConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &BasemapConfig {
        &self.config
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    fn providers(&self, style: BasemapStyle) -> Vec<Arc<dyn TileSource>> {
        match &self.sources {
            SourceSelection::ByStyle(client) => style.providers(client),
            SourceSelection::Fixed(sources) => sources.clone(),
        }
    }

    /// Tile grid a view resolves to on a `width x height` canvas. Canvases
    /// more extreme than 1:4 are planned as 1:4.
    pub fn plan(view: &BasemapView, width: u32, height: u32) -> TileGrid {
        match view {
            BasemapView::Fit { bounds } => {
                let padded = bounds.prepared();
                let zoom = zoom_for_bounds(&padded);
                TileGrid::covering(&padded, zoom)
                    .expanded_to_aspect((width as f64 / height.max(1) as f64).clamp(MIN_ASPECT, MAX_ASPECT))
            }
            BasemapView::Exact { bounds, zoom } => {
                TileGrid::covering(&bounds.with_min_span(MIN_BOUNDS_SPAN), *zoom)
            }
        }
    }

    /// Assemble a basemap for `view` at `width x height` in the configured
    /// style.
    pub async fn assemble(&self, view: &BasemapView, width: u32, height: u32) -> Result<Basemap> {
        self.assemble_with_style(view, width, height, self.config.style).await
    }

    /// Like [`assemble`](Self::assemble) but with a per-call provider chain.
    /// Has no effect on an assembler built with explicit sources.
    pub async fn assemble_with_style(
        &self,
        view: &BasemapView,
        width: u32,
        height: u32,
        style: BasemapStyle,
    ) -> Result<Basemap> {
        let width = width.max(1);
        let height = height.max(1);
        let grid = Self::plan(view, width, height);

        info!(
            "[Basemap] Zoom {}, fetching {} tiles ({}x{})",
            grid.zoom,
            grid.tile_count(),
            grid.tiles_wide(),
            grid.tiles_high()
        );

        let (provider, tiles) = self.fetch_grid(&grid, self.providers(style)).await?;
        let tiles_from_cache = tiles.iter().filter(|t| t.from_cache).count();
        let tiles_downloaded = tiles.len() - tiles_from_cache;
        info!(
            "[Basemap] Loaded {}/{} tiles from {} ({} cached, {} downloaded)",
            tiles.len(),
            grid.tile_count(),
            provider,
            tiles_from_cache,
            tiles_downloaded
        );

        let mut stitched = stitch(&grid, &tiles);

        let extent = match view {
            BasemapView::Fit { .. } => grid.extent(),
            BasemapView::Exact { bounds, .. } => {
                let (cropped, extent) = crop_to_bounds(&stitched, &grid, bounds);
                stitched = cropped;
                extent
            }
        };

        self.config.tone.apply(&mut stitched);
        let image = if stitched.dimensions() == (width, height) {
            stitched
        } else {
            imageops::resize(&stitched, width, height, FilterType::Lanczos3)
        };

        Ok(Basemap {
            image,
            extent,
            grid,
            provider,
            tiles_from_cache,
            tiles_downloaded,
        })
    }

    /// Fetch the grid from the first provider that yields any tile.
    async fn fetch_grid(
        &self,
        grid: &TileGrid,
        providers: Vec<Arc<dyn TileSource>>,
    ) -> Result<(String, Vec<FetchedTile>)> {
        let provider_count = providers.len();
        let coords = grid.tiles();

        let chosen = first_success(&providers, |index, source| {
            let coords = &coords;
            async move {
                let tiles = self.fetch_from(source.as_ref(), coords).await;
                if tiles.is_empty() {
                    warn!(
                        "[Basemap] Provider {} ({}/{}) returned no tiles, trying next",
                        source.name(),
                        index + 1,
                        provider_count
                    );
                    None
                } else {
                    Some(tiles)
                }
            }
        })
        .await;

        match chosen {
            Some((index, tiles)) => Ok((providers[index].name().to_string(), tiles)),
            None => Err(Error::NoTiles {
                provider_count,
                tile_count: coords.len(),
                zoom: grid.zoom,
            }),
        }
    }

    /// Every tile of `coords` this source can supply, cache first.
    async fn fetch_from(&self, source: &dyn TileSource, coords: &[TileCoord]) -> Vec<FetchedTile> {
        let name = source.name();
        stream::iter(coords.iter().copied())
            .map(|coord| async move {
                if let Some(image) = self.cache.get(name, coord) {
                    return Some(FetchedTile {
                        coord,
                        image,
                        from_cache: true,
                    });
                }

                let bytes = match source.fetch(coord).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("[Basemap] {} tile {:?} failed: {}", name, coord, e);
                        return None;
                    }
                };
                match image::load_from_memory(&bytes) {
                    Ok(decoded) => {
                        self.cache.put(name, coord, &bytes);
                        Some(FetchedTile {
                            coord,
                            image: decoded.to_rgba8(),
                            from_cache: false,
                        })
                    }
                    Err(e) => {
                        warn!("[Basemap] {} tile {:?} undecodable: {}", name, coord, e);
                        None
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .filter_map(|tile| async move { tile })
            .collect()
            .await
    }
}

/// Paste tiles into one raster at native resolution.
fn stitch(grid: &TileGrid, tiles: &[FetchedTile]) -> RgbaImage {
    let (w, h) = grid.pixel_size();
    let mut canvas = RgbaImage::from_pixel(w, h, CANVAS_FILL);
    for tile in tiles {
        let px = ((tile.coord.x - grid.min_x) * TILE_SIZE) as i64;
        let py = ((tile.coord.y - grid.min_y) * TILE_SIZE) as i64;
        if tile.image.dimensions() == (TILE_SIZE, TILE_SIZE) {
            imageops::replace(&mut canvas, &tile.image, px, py);
        } else {
            debug!("[Basemap] Rescaling {:?} tile to {}px", tile.image.dimensions(), TILE_SIZE);
            let scaled = imageops::resize(&tile.image, TILE_SIZE, TILE_SIZE, FilterType::Lanczos3);
            imageops::replace(&mut canvas, &scaled, px, py);
        }
    }
    canvas
}

/// Crop a stitched grid to `bounds` in pixel space and report the extent of
/// the whole-pixel crop.
fn crop_to_bounds(stitched: &RgbaImage, grid: &TileGrid, bounds: &Bounds) -> (RgbaImage, MapExtent) {
    let n = tiles_per_axis(grid.zoom) as f64;
    let tile = TILE_SIZE as f64;
    let (w, h) = stitched.dimensions();

    let to_px_x = |lon: f64| (lon_to_mercator_x(lon) * n - grid.min_x as f64) * tile;
    let to_px_y = |lat: f64| (lat_to_mercator_y(lat) * n - grid.min_y as f64) * tile;

    let x0 = (to_px_x(bounds.min_lng).floor().max(0.0) as u32).min(w - 1);
    let x1 = (to_px_x(bounds.max_lng).ceil() as u32).clamp(x0 + 1, w);
    let y0 = (to_px_y(bounds.max_lat).floor().max(0.0) as u32).min(h - 1);
    let y1 = (to_px_y(bounds.min_lat).ceil() as u32).clamp(y0 + 1, h);

    let to_merc_x = |px: u32| (grid.min_x as f64 + px as f64 / tile) / n;
    let to_merc_y = |py: u32| (grid.min_y as f64 + py as f64 / tile) / n;
    let extent = MapExtent::from_mercator(to_merc_x(x0), to_merc_x(x1), to_merc_y(y0), to_merc_y(y1));

    let cropped = imageops::crop_imm(stitched, x0, y0, x1 - x0, y1 - y0).to_image();
    (cropped, extent)
}

// ============================================================================
// Tests
// ============================================================================
