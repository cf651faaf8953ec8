//! # Route Compositor
//!
//! Draws smoothed routes onto a background in the same Web-Mercator space
//! as the basemap underneath them.
//!
//! ## Pipeline
//!
//! 1. Smooth every trace.
//! 2. Size the canvas from the route's latitude-corrected aspect (or square).
//! 3. Produce a background: basemap, photo or solid. A basemap or photo that
//!    cannot be produced degrades to the solid background colour.
//! 4. Project points with the background's [`MapExtent`] (X linear in
//!    longitude, Y linear in Mercator Y) and stroke them.
//! 5. Draw start and end markers.
//! 6. Draw the title overlay, if configured.
//!
//! Sizes given in points are converted at 100 dpi.
//!
//! | Mode   | Line alpha | Start marker           | End marker               |
//! |--------|------------|------------------------|--------------------------|
//! | Single | 1.0        | green, white edge      | red, white edge          |
//! | Multi  | 0.7        | route colour, 0.8      | white, route-colour edge |

use std::future::Future;
use std::path::Path;

use image::{ImageFormat, Rgba, RgbaImage};
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tiny_skia::{FillRule, LineCap, LineJoin, Paint, PathBuilder, Pixmap, Stroke, Transform};

use crate::annotate::{Fonts, OverlaySpec};
use crate::background::{self, Background};
use crate::basemap::{BasemapAssembler, BasemapView, MAX_ASPECT, MIN_ASPECT};
use crate::color::{palette_color, parse_color, with_alpha, ROUTE_ORANGE};
use crate::geo_utils::combined_bounds;
use crate::projection::{lon_to_mercator_x, MapExtent};
use crate::smoothing::{smooth_many, SmoothingSpec};
use crate::tile_cache::TileCache;
use crate::tile_source::default_client;
use crate::{Activity, Bounds, Error, GpsPoint, Result, MIN_BOUNDS_SPAN};

/// Pixels per typographic point at the 100 dpi output resolution.
pub const POINTS_TO_PIXELS: f32 = 100.0 / 72.0;

const MULTI_LINE_ALPHA: f32 = 0.7;
const MULTI_MARKER_ALPHA: f32 = 0.8;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const START_GREEN: Rgba<u8> = Rgba([0, 128, 0, 255]);
const END_RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for rendering routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Output width in pixels.
    /// Default: 5000
    pub width_px: u32,

    /// Make the canvas square instead of following the route's shape.
    /// Default: false
    pub force_square: bool,

    /// Preset name or explicit smoothing method.
    /// Default: "medium"
    pub smoothing: SmoothingSpec,

    /// Route colour for single-activity renders.
    /// Default: "#FC4C02"
    pub line_color: String,

    /// Route width in points.
    /// Default: 10
    pub line_width: f32,

    /// Draw start and end markers.
    /// Default: true
    pub show_markers: bool,

    /// Marker diameter in points. `None` uses 20 for a single activity and
    /// 15 for several.
    /// Default: None
    pub marker_size: Option<f32>,

    /// What to draw under the route.
    /// Default: minimal basemap
    pub background: Background,

    /// Solid background colour, also used when a basemap or photo fails.
    /// Default: "white"
    pub background_color: String,

    /// Explicit basemap zoom, to reproduce an earlier view.
    /// Default: None
    pub zoom: Option<u8>,

    /// Explicit view bounds instead of the routes' own.
    /// Default: None
    pub bounds: Option<Bounds>,

    /// One colour for every activity of a multi-activity render.
    /// Default: None
    pub single_color: Option<String>,

    /// Title panel drawn over the finished map.
    /// Default: None
    pub overlay: Option<OverlaySpec>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width_px: 5000,
            force_square: false,
            smoothing: SmoothingSpec::default(),
            line_color: ROUTE_ORANGE.to_string(),
            line_width: 10.0,
            show_markers: true,
            marker_size: None,
            background: Background::default(),
            background_color: "white".to_string(),
            zoom: None,
            bounds: None,
            single_color: None,
            overlay: None,
        }
    }
}

impl RenderConfig {
    /// The basemap view these settings ask for, given the routes' bounds.
    pub fn view(&self, route_bounds: &Bounds) -> BasemapView {
        match (self.bounds, self.zoom) {
            (Some(bounds), Some(zoom)) => BasemapView::Exact { bounds, zoom },
            (None, Some(zoom)) => BasemapView::Exact { bounds: route_bounds.prepared(), zoom },
            (Some(bounds), None) => BasemapView::Fit { bounds },
            (None, None) => BasemapView::Fit { bounds: *route_bounds },
        }
    }

    /// Bounds a non-map background is framed on.
    fn frame_bounds(&self, route_bounds: &Bounds) -> Bounds {
        match self.bounds {
            Some(bounds) => bounds.with_min_span(MIN_BOUNDS_SPAN),
            None => route_bounds.prepared(),
        }
    }
}

/// One route of a multi-activity render.
#[derive(Debug, Clone, Default)]
pub struct ActivityTrace {
    pub points: Vec<GpsPoint>,
    /// Explicit colour; otherwise a palette colour by position
    pub color: Option<String>,
}

impl ActivityTrace {
    pub fn new(points: Vec<GpsPoint>) -> Self {
        Self { points, color: None }
    }

    pub fn with_color(mut self, color: &str) -> Self {
        self.color = Some(color.to_string());
        self
    }
}

impl From<&Activity> for ActivityTrace {
    fn from(activity: &Activity) -> Self {
        Self {
            points: activity.points.clone(),
            color: activity.color.clone(),
        }
    }
}

// ============================================================================
// Styles
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct MarkerStyle {
    fill: Rgba<u8>,
    edge: Rgba<u8>,
    /// Edge width in points
    edge_width: f32,
}

#[derive(Debug, Clone, Copy)]
struct TraceStyle {
    line: Rgba<u8>,
    start: MarkerStyle,
    end: MarkerStyle,
}

impl TraceStyle {
    fn single(color: Rgba<u8>) -> Self {
        Self {
            line: color,
            start: MarkerStyle { fill: START_GREEN, edge: WHITE, edge_width: 1.0 },
            end: MarkerStyle { fill: END_RED, edge: WHITE, edge_width: 1.0 },
        }
    }

    fn multi(color: Rgba<u8>) -> Self {
        Self {
            line: with_alpha(color, MULTI_LINE_ALPHA),
            start: MarkerStyle {
                fill: with_alpha(color, MULTI_MARKER_ALPHA),
                edge: with_alpha(WHITE, MULTI_MARKER_ALPHA),
                edge_width: 0.5,
            },
            end: MarkerStyle {
                fill: with_alpha(WHITE, MULTI_MARKER_ALPHA),
                edge: with_alpha(color, MULTI_MARKER_ALPHA),
                edge_width: 1.0,
            },
        }
    }
}

// ============================================================================
// Renderer
// ============================================================================

/// Renders routes over basemaps, photos or solid colours.
pub struct Renderer {
    assembler: BasemapAssembler,
    client: Client,
}

impl Renderer {
    /// Renderer fetching tiles over HTTP through `cache`.
    pub fn new(cache: TileCache) -> Result<Self> {
        let client = default_client()?;
        Ok(Self {
            assembler: BasemapAssembler::new(cache, client.clone()),
            client,
        })
    }

    /// Renderer over a preconfigured assembler. `client` downloads photos.
    pub fn with_assembler(assembler: BasemapAssembler, client: Client) -> Self {
        Self { assembler, client }
    }

    pub fn assembler(&self) -> &BasemapAssembler {
        &self.assembler
    }

    /// Render one activity's trace.
    pub async fn render(&self, trace: &[GpsPoint], config: &RenderConfig) -> Result<RgbaImage> {
        if trace.is_empty() {
            return Err(Error::EmptyTrace);
        }
        let color = parse_color(&config.line_color)?;
        let marker_size = config.marker_size.unwrap_or(20.0);
        let mut image = self
            .compose(&[trace.to_vec()], &[TraceStyle::single(color)], marker_size, config)
            .await?;
        if let Some(overlay) = &config.overlay {
            self.draw_overlay(&mut image, overlay).await?;
        }
        Ok(image)
    }

    /// Render several activities over one shared background.
    ///
    /// Colour priority: `config.single_color`, then the trace's own colour,
    /// then the palette by position. Empty traces are skipped.
    pub async fn render_many(&self, traces: &[ActivityTrace], config: &RenderConfig) -> Result<RgbaImage> {
        let mut image = self.render_many_map(traces, config).await?;
        if let Some(overlay) = &config.overlay {
            self.draw_overlay(&mut image, overlay).await?;
        }
        Ok(image)
    }

    /// [`render_many`](Self::render_many) without the overlay, for callers
    /// that add a border first.
    pub(crate) async fn render_many_map(
        &self,
        traces: &[ActivityTrace],
        config: &RenderConfig,
    ) -> Result<RgbaImage> {
        if traces.is_empty() {
            return Err(Error::NoActivities);
        }
        let single = config.single_color.as_deref().map(parse_color).transpose()?;

        let mut points = Vec::with_capacity(traces.len());
        let mut styles = Vec::with_capacity(traces.len());
        for (i, trace) in traces.iter().enumerate() {
            if trace.points.is_empty() {
                debug!("[Compositor] Skipping empty trace {}", i);
                continue;
            }
            let color = match (single, trace.color.as_deref()) {
                (Some(color), _) => color,
                (None, Some(hex)) => parse_color(hex)?,
                (None, None) => palette_color(i),
            };
            points.push(trace.points.clone());
            styles.push(TraceStyle::multi(color));
        }
        if points.is_empty() {
            return Err(Error::EmptyTrace);
        }

        let marker_size = config.marker_size.unwrap_or(15.0);
        self.compose(&points, &styles, marker_size, config).await
    }

    /// Draw `spec` onto `image`. A photo that cannot be downloaded is left
    /// out; missing fonts are an error.
    pub async fn draw_overlay(&self, image: &mut RgbaImage, spec: &OverlaySpec) -> Result<()> {
        let fonts = Fonts::load(&spec.fonts)?;
        let photo = match spec.photo_url.as_deref() {
            Some(url) if spec.style.show_photo => {
                let photo = background::download_image(&self.client, url).await;
                if photo.is_none() {
                    warn!("[Compositor] Profile photo unavailable, drawing title only");
                }
                photo
            }
            _ => None,
        };
        spec.to_overlay(photo).draw(image, &spec.style, &fonts)
    }

    /// [`render`](Self::render) on a private runtime. Must not be called from
    /// inside an async context.
    pub fn render_blocking(&self, trace: &[GpsPoint], config: &RenderConfig) -> Result<RgbaImage> {
        block_on(self.render(trace, config))?
    }

    /// [`render_many`](Self::render_many) on a private runtime.
    pub fn render_many_blocking(&self, traces: &[ActivityTrace], config: &RenderConfig) -> Result<RgbaImage> {
        block_on(self.render_many(traces, config))?
    }

    async fn compose(
        &self,
        traces: &[Vec<GpsPoint>],
        styles: &[TraceStyle],
        marker_size: f32,
        config: &RenderConfig,
    ) -> Result<RgbaImage> {
        let smoothing = config.smoothing.resolve();
        let smoothed = smooth_many(traces, &smoothing);
        let route_bounds =
            combined_bounds(smoothed.iter().map(|t| t.as_slice())).ok_or(Error::EmptyTrace)?;

        let (width, height) = canvas_size(
            &config.bounds.unwrap_or(route_bounds),
            config.width_px,
            config.force_square,
        );
        info!(
            "[Compositor] Rendering {} trace(s) at {}x{} with {:?}",
            smoothed.len(),
            width,
            height,
            smoothing
        );

        let (canvas, extent) = self.background(config, &route_bounds, width, height).await?;
        let mut pixmap = to_pixmap(&canvas)?;

        let line_px = config.line_width * POINTS_TO_PIXELS;
        let radius = marker_size * POINTS_TO_PIXELS / 2.0;
        for (trace, style) in smoothed.iter().zip(styles) {
            let projected: Vec<(f32, f32)> = trace
                .iter()
                .map(|p| extent.project(p, width, height))
                .collect();
            stroke_route(&mut pixmap, &projected, style.line, line_px);
            if config.show_markers {
                if let (Some(&first), Some(&last)) = (projected.first(), projected.last()) {
                    draw_marker(&mut pixmap, first, radius, &style.start);
                    draw_marker(&mut pixmap, last, radius, &style.end);
                }
            }
        }

        Ok(from_pixmap(&pixmap))
    }

    /// Background raster and the extent it covers.
    async fn background(
        &self,
        config: &RenderConfig,
        route_bounds: &Bounds,
        width: u32,
        height: u32,
    ) -> Result<(RgbaImage, MapExtent)> {
        let fallback = parse_color(&config.background_color)?;

        match &config.background {
            Background::Basemap { style } => {
                let view = config.view(route_bounds);
                match self.assembler.assemble_with_style(&view, width, height, *style).await {
                    Ok(basemap) => return Ok((basemap.image, basemap.extent)),
                    Err(e) => warn!("[Compositor] Basemap unavailable ({}), using solid background", e),
                }
            }
            Background::Photo { url } => {
                if let Some(photo) = background::download_image(&self.client, url).await {
                    let extent = fit_extent(&config.frame_bounds(route_bounds), width, height);
                    return Ok((background::photo_backdrop(&photo, width, height), extent));
                }
                warn!("[Compositor] Photo background unavailable, using solid background");
            }
            Background::Solid => {}
        }

        let extent = fit_extent(&config.frame_bounds(route_bounds), width, height);
        Ok((background::solid(width, height, fallback), extent))
    }
}

/// Run a future to completion on a fresh multi-threaded runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Runtime(format!("failed to create tokio runtime: {}", e)))?;
    Ok(runtime.block_on(future))
}

/// Write a raster as PNG.
pub fn save_png(image: &RgbaImage, path: &Path) -> Result<()> {
    image.save_with_format(path, ImageFormat::Png)?;
    info!("[Compositor] Saved {}x{} image to {}", image.width(), image.height(), path.display());
    Ok(())
}

// ============================================================================
// Geometry
// ============================================================================

/// Canvas size for a route: `width_px` wide, and as tall as the bounds'
/// latitude-corrected aspect asks, within 1:4 and 4:1.
pub fn canvas_size(bounds: &Bounds, width_px: u32, force_square: bool) -> (u32, u32) {
    let width = width_px.max(1);
    if force_square {
        return (width, width);
    }
    let bounds = bounds.with_min_span(MIN_BOUNDS_SPAN);
    let lon_scale = bounds.center().latitude.to_radians().cos().max(0.01);
    let ratio = (bounds.lat_span() / (bounds.lng_span() * lon_scale)).clamp(MIN_ASPECT, MAX_ASPECT);
    (width, ((width as f64 * ratio) as u32).max(1))
}

/// Extent covering `bounds` and widened on one axis, about its centre, so
/// that it maps onto `width x height` without distortion.
pub fn fit_extent(bounds: &Bounds, width: u32, height: u32) -> MapExtent {
    let extent = MapExtent::from_bounds(bounds);
    let mut left = lon_to_mercator_x(extent.min_lng);
    let mut right = lon_to_mercator_x(extent.max_lng);
    let mut top = extent.top_y;
    let mut bottom = extent.bottom_y;

    let dx = right - left;
    let dy = bottom - top;
    if dx <= 0.0 || dy <= 0.0 {
        return extent;
    }

    let target = width.max(1) as f64 / height.max(1) as f64;
    if dx / dy < target {
        let grow = (dy * target - dx) / 2.0;
        left -= grow;
        right += grow;
    } else {
        let grow = (dx / target - dy) / 2.0;
        top -= grow;
        bottom += grow;
    }
    MapExtent::from_mercator(left, right, top, bottom)
}

// ============================================================================
// Drawing
// ============================================================================

fn paint(color: Rgba<u8>) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(color[0], color[1], color[2], color[3]);
    paint.anti_alias = true;
    paint
}

fn stroke_route(pixmap: &mut Pixmap, points: &[(f32, f32)], color: Rgba<u8>, width: f32) {
    let Some(&(x0, y0)) = points.first() else {
        return;
    };
    let mut pb = PathBuilder::new();
    pb.move_to(x0, y0);
    for &(x, y) in &points[1..] {
        pb.line_to(x, y);
    }
    // A single point produces no path; markers still show it.
    let Some(path) = pb.finish() else {
        return;
    };

    let stroke = Stroke {
        width,
        line_cap: LineCap::Round,
        line_join: LineJoin::Round,
        ..Stroke::default()
    };
    pixmap.stroke_path(&path, &paint(color), &stroke, Transform::identity(), None);
}

fn draw_marker(pixmap: &mut Pixmap, (x, y): (f32, f32), radius: f32, style: &MarkerStyle) {
    let Some(circle) = PathBuilder::from_circle(x, y, radius.max(0.5)) else {
        return;
    };
    pixmap.fill_path(&circle, &paint(style.fill), FillRule::Winding, Transform::identity(), None);

    let edge = Stroke {
        width: style.edge_width * POINTS_TO_PIXELS,
        ..Stroke::default()
    };
    pixmap.stroke_path(&circle, &paint(style.edge), &edge, Transform::identity(), None);
}

/// Copy a straight-alpha raster into a premultiplied pixmap.
fn to_pixmap(image: &RgbaImage) -> Result<Pixmap> {
    let (w, h) = image.dimensions();
    let mut pixmap = Pixmap::new(w, h)
        .ok_or_else(|| Error::Runtime(format!("cannot allocate a {}x{} canvas", w, h)))?;
    for (dst, src) in pixmap.data_mut().chunks_exact_mut(4).zip(image.pixels()) {
        let a = u16::from(src[3]);
        dst[0] = (u16::from(src[0]) * a / 255) as u8;
        dst[1] = (u16::from(src[1]) * a / 255) as u8;
        dst[2] = (u16::from(src[2]) * a / 255) as u8;
        dst[3] = src[3];
    }
    Ok(pixmap)
}

/// Un-premultiply a pixmap back into a straight-alpha raster.
fn from_pixmap(pixmap: &Pixmap) -> RgbaImage {
    let mut image = RgbaImage::new(pixmap.width(), pixmap.height());
    for (dst, src) in image.pixels_mut().zip(pixmap.data().chunks_exact(4)) {
        let a = u16::from(src[3]);
        *dst = if a == 0 {
            Rgba([0, 0, 0, 0])
        } else {
            Rgba([
                (u16::from(src[0]) * 255 / a) as u8,
                (u16::from(src[1]) * 255 / a) as u8,
                (u16::from(src[2]) * 255 / a) as u8,
                src[3],
            ])
        };
    }
    image
}
