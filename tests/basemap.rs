//! Basemap assembly and rendering against in-process tile providers.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};
use reqwest::Client;
use tempfile::TempDir;

use route_canvas::color::ToneAdjustment;
use route_canvas::projection::zoom_for_bounds;
use route_canvas::{
    Background, BasemapAssembler, BasemapConfig, BasemapView, Bounds, FontSource, GpsPoint, OverlayConfig,
    OverlaySpec, RenderConfig, Renderer, SmoothingPreset, TileCache, TileCoord, TileFetchError, TileGrid,
    TileSource, TILE_SIZE,
};

/// Serves checkerboard tiles tinted with `color`, or fails when `color` is `None`.
struct MockProvider {
    name: &'static str,
    color: Option<[u8; 3]>,
    requests: AtomicUsize,
}

impl MockProvider {
    fn new(name: &'static str, color: Option<[u8; 3]>) -> Arc<Self> {
        Arc::new(Self { name, color, requests: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl TileSource for MockProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch(&self, coord: TileCoord) -> Result<Vec<u8>, TileFetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let [r, g, b] = self.color.ok_or(TileFetchError::Status(500))?;
        let shade = ((coord.x + coord.y) % 2) as u8 * 40;
        let tile = RgbaImage::from_pixel(TILE_SIZE, TILE_SIZE, Rgba([r, g.saturating_sub(shade), b, 255]));
        let mut bytes = Cursor::new(Vec::new());
        tile.write_to(&mut bytes, ImageFormat::Png)
            .map_err(|e| TileFetchError::Unavailable(e.to_string()))?;
        Ok(bytes.into_inner())
    }
}

fn assembler(dir: &TempDir, sources: Vec<Arc<dyn TileSource>>) -> BasemapAssembler {
    BasemapAssembler::with_sources(TileCache::new(dir.path()), sources).with_config(BasemapConfig {
        tone: ToneAdjustment::IDENTITY,
        ..Default::default()
    })
}

fn zurich_trace() -> Vec<GpsPoint> {
    vec![
        GpsPoint::new(47.371, 8.531),
        GpsPoint::new(47.374, 8.536),
        GpsPoint::new(47.377, 8.540),
        GpsPoint::new(47.379, 8.544),
    ]
}

fn zurich() -> Bounds {
    Bounds {
        min_lat: 47.370,
        max_lat: 47.380,
        min_lng: 8.530,
        max_lng: 8.545,
    }
}

#[test]
fn test_tiny_box_plans_max_zoom() {
    let tiny = Bounds {
        min_lat: 47.3700,
        max_lat: 47.3710,
        min_lng: 8.5400,
        max_lng: 8.5410,
    };
    assert_eq!(zoom_for_bounds(&tiny.prepared()), 16);

    let grid = BasemapAssembler::plan(&BasemapView::Fit { bounds: tiny }, 600, 600);
    assert_eq!(grid.zoom, 16);
    assert!(grid.tiles_wide() >= 1 && grid.tiles_high() >= 1);
}

#[test]
fn test_grid_covers_requested_bounds() {
    let bounds = zurich();
    let grid = TileGrid::covering(&bounds, 14);
    let extent = grid.extent();
    assert!(extent.min_lat <= bounds.min_lat && extent.max_lat >= bounds.max_lat);
    assert!(extent.min_lng <= bounds.min_lng && extent.max_lng >= bounds.max_lng);
}

#[tokio::test]
async fn test_fallback_matches_working_provider() {
    let down_a = MockProvider::new("down-a", None);
    let down_b = MockProvider::new("down-b", None);
    let up = MockProvider::new("up", Some([30, 160, 220]));
    let view = BasemapView::Fit { bounds: zurich() };

    let chain_dir = TempDir::new().unwrap();
    let chained = assembler(
        &chain_dir,
        vec![
            down_a.clone() as Arc<dyn TileSource>,
            down_b.clone() as Arc<dyn TileSource>,
            up.clone() as Arc<dyn TileSource>,
        ],
    );
    let via_fallback = chained.assemble(&view, 400, 300).await.unwrap();

    let direct_dir = TempDir::new().unwrap();
    let direct = assembler(&direct_dir, vec![MockProvider::new("up", Some([30, 160, 220])) as Arc<dyn TileSource>]);
    let from_primary = direct.assemble(&view, 400, 300).await.unwrap();

    assert_eq!(via_fallback.provider, "up");
    assert_eq!(via_fallback.image, from_primary.image);
    assert_eq!(via_fallback.extent, from_primary.extent);

    let cache = chained.cache();
    assert_eq!(cache.provider_stats("down-a").tiles, 0);
    assert_eq!(cache.provider_stats("down-b").tiles, 0);
    assert_eq!(cache.provider_stats("up").tiles, via_fallback.grid.tile_count());
    assert!(down_a.requests.load(Ordering::SeqCst) > 0);
    assert!(down_b.requests.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_second_assembly_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let provider = MockProvider::new("osm", Some([200, 200, 200]));
    let basemaps = assembler(&dir, vec![provider.clone() as Arc<dyn TileSource>]);
    let view = BasemapView::Fit { bounds: zurich() };

    let first = basemaps.assemble(&view, 256, 256).await.unwrap();
    let requests = provider.requests.load(Ordering::SeqCst);
    let second = basemaps.assemble(&view, 256, 256).await.unwrap();

    assert_eq!(first.tiles_downloaded, first.grid.tile_count());
    assert_eq!(second.tiles_from_cache, second.grid.tile_count());
    assert_eq!(provider.requests.load(Ordering::SeqCst), requests);
    assert_eq!(first.image, second.image);
}

#[tokio::test]
async fn test_all_providers_down_is_an_error() {
    let dir = TempDir::new().unwrap();
    let basemaps = assembler(&dir, vec![MockProvider::new("down", None) as Arc<dyn TileSource>]);
    let result = basemaps.assemble(&BasemapView::Fit { bounds: zurich() }, 256, 256).await;
    assert!(matches!(result, Err(route_canvas::Error::NoTiles { provider_count: 1, .. })));
}

#[tokio::test]
async fn test_route_rendered_over_basemap() {
    let dir = TempDir::new().unwrap();
    let renderer = Renderer::with_assembler(
        assembler(&dir, vec![MockProvider::new("tint", Some([40, 90, 40])) as Arc<dyn TileSource>]),
        Client::new(),
    );
    let trace = zurich_trace();
    let config = RenderConfig {
        width_px: 500,
        smoothing: SmoothingPreset::None.into(),
        background: Background::Basemap { style: Default::default() },
        ..Default::default()
    };

    let image = renderer.render(&trace, &config).await.unwrap();
    assert_eq!(image.width(), 500);

    // Corners show the map, not the fallback colour.
    let corner = image.get_pixel(0, 0);
    assert!(corner[0].abs_diff(40) <= 1 && corner[2].abs_diff(40) <= 1, "{:?}", corner);
    assert!(renderer.assembler().cache().stats().tiles > 0);
}

#[tokio::test]
async fn test_overlay_drawn_over_basemap() {
    let dir = TempDir::new().unwrap();
    let renderer = Renderer::with_assembler(
        assembler(&dir, vec![MockProvider::new("tint", Some([40, 90, 40])) as Arc<dyn TileSource>]),
        Client::new(),
    );
    let plain = RenderConfig {
        width_px: 500,
        smoothing: SmoothingPreset::None.into(),
        background: Background::Basemap { style: Default::default() },
        ..Default::default()
    };
    let with_overlay = RenderConfig {
        overlay: Some(OverlaySpec {
            title: "Zurich Loop".into(),
            distance: Some(12_300.0),
            moving_time: Some(3723.0),
            // Nothing listens here; the panel is drawn without the photo.
            photo_url: Some("http://127.0.0.1:9/profile.png".into()),
            style: OverlayConfig { margin: 0.0, ..Default::default() },
            fonts: FontSource::File {
                regular: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/DejaVuSans.ttf")),
                bold: None,
            },
        }),
        ..plain.clone()
    };

    let without = renderer.render(&zurich_trace(), &plain).await.unwrap();
    let with = renderer.render(&zurich_trace(), &with_overlay).await.unwrap();
    assert_eq!(with.dimensions(), without.dimensions());

    // Top-left panel darkens the map; the opposite corner is untouched.
    let (w, h) = with.dimensions();
    assert_ne!(with.get_pixel(0, 0), without.get_pixel(0, 0));
    assert!(with.get_pixel(0, 0)[1] < without.get_pixel(0, 0)[1]);
    assert_eq!(with.get_pixel(w - 1, h - 1), without.get_pixel(w - 1, h - 1));
}
