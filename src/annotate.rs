//! # Annotations
//!
//! Post-processing applied to a rendered route:
//!
//! | Annotation        | Placement                                      |
//! |-------------------|------------------------------------------------|
//! | Border            | 3% top and sides, 20% bottom                   |
//! | Statistics panel  | Inside the bottom border: title + 2 rows of 3  |
//! | Title overlay     | Translucent panel anchored to one corner       |
//!
//! Text needs a TrueType font. Fonts come from an explicit file or the first
//! match in a list of common system locations; a missing font is an
//! [`Error::FontUnavailable`].

use std::fs;
use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, FontVec};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::background::cover_fit;
use crate::color::parse_color;
use crate::geo_utils::polyline_length;
use crate::stats::{format_duration, StatCell, StatsPanel, Units};
use crate::{Activity, Error, Result};

const TITLE_COLOR: Rgba<u8> = Rgba([0x2c, 0x2c, 0x2c, 255]);
const NUMBER_COLOR: Rgba<u8> = Rgba([0x1a, 0x1a, 0x1a, 255]);
const LABEL_COLOR: Rgba<u8> = Rgba([0x7a, 0x7a, 0x7a, 255]);

/// Smallest title size the overlay will shrink to, in pixels.
const MIN_TITLE_PX: f32 = 10.0;

/// (regular, bold) pairs tried in order by [`FontSource::System`].
const SYSTEM_FONTS: &[(&str, &str)] = &[
    (
        "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    ),
    (
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    ),
    ("/usr/share/fonts/TTF/DejaVuSans.ttf", "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf"),
    ("/System/Library/Fonts/Helvetica.ttc", "/System/Library/Fonts/Helvetica.ttc"),
    ("/Library/Fonts/Arial.ttf", "/Library/Fonts/Arial Bold.ttf"),
    ("C:\\Windows\\Fonts\\arial.ttf", "C:\\Windows\\Fonts\\arialbd.ttf"),
];

// ============================================================================
// Fonts
// ============================================================================

/// Where to load fonts from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FontSource {
    /// First installed font of a list of common system paths
    #[default]
    System,
    /// Explicit font files. Without `bold` the regular face is used for both.
    File {
        regular: PathBuf,
        #[serde(default)]
        bold: Option<PathBuf>,
    },
}

/// Regular and bold faces used for text.
#[derive(Clone)]
pub struct Fonts {
    pub regular: FontArc,
    pub bold: FontArc,
}

impl Fonts {
    pub fn load(source: &FontSource) -> Result<Self> {
        match source {
            FontSource::File { regular, bold } => {
                let regular = load_face(regular)?;
                let bold = match bold {
                    Some(path) => load_face(path)?,
                    None => regular.clone(),
                };
                Ok(Self { regular, bold })
            }
            FontSource::System => {
                for (regular, bold) in SYSTEM_FONTS {
                    let Ok(regular_face) = load_face(Path::new(regular)) else {
                        continue;
                    };
                    let bold_face = load_face(Path::new(bold)).unwrap_or_else(|_| regular_face.clone());
                    debug!("[Annotate] Using system font {}", regular);
                    return Ok(Self { regular: regular_face, bold: bold_face });
                }
                Err(Error::FontUnavailable("no system font found".to_string()))
            }
        }
    }

    /// Faces from in-memory font data.
    pub fn from_bytes(regular: Vec<u8>, bold: Option<Vec<u8>>) -> Result<Self> {
        let regular = parse_face(regular, "regular")?;
        let bold = match bold {
            Some(data) => parse_face(data, "bold")?,
            None => regular.clone(),
        };
        Ok(Self { regular, bold })
    }
}

fn load_face(path: &Path) -> Result<FontArc> {
    let data = fs::read(path).map_err(|e| Error::FontUnavailable(format!("{}: {}", path.display(), e)))?;
    parse_face(data, &path.display().to_string())
}

fn parse_face(data: Vec<u8>, what: &str) -> Result<FontArc> {
    FontVec::try_from_vec_and_index(data, 0)
        .map(FontArc::new)
        .map_err(|e| Error::FontUnavailable(format!("{}: {}", what, e)))
}

// ============================================================================
// Border
// ============================================================================

/// Border sizes as percentages of the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BorderConfig {
    /// Default: 3 (of height)
    pub top_percent: f32,
    /// Default: 3 (of width, each side)
    pub sides_percent: f32,
    /// Default: 20 (of height), room for the statistics panel
    pub bottom_percent: f32,
    /// Default: "white"
    pub color: String,
}

impl Default for BorderConfig {
    fn default() -> Self {
        Self {
            top_percent: 3.0,
            sides_percent: 3.0,
            bottom_percent: 20.0,
            color: "white".to_string(),
        }
    }
}

/// Pixel sizes of an added border.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorderInsets {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// Surround `image` with a border; returns the new image and the insets.
pub fn add_border(image: &RgbaImage, config: &BorderConfig) -> Result<(RgbaImage, BorderInsets)> {
    let color = parse_color(&config.color)?;
    let (w, h) = image.dimensions();
    let side = (w as f32 * config.sides_percent / 100.0) as u32;
    let insets = BorderInsets {
        left: side,
        right: side,
        top: (h as f32 * config.top_percent / 100.0) as u32,
        bottom: (h as f32 * config.bottom_percent / 100.0) as u32,
    };

    let mut out = RgbaImage::from_pixel(
        w + insets.left + insets.right,
        h + insets.top + insets.bottom,
        Rgba([color[0], color[1], color[2], 255]),
    );
    image::imageops::replace(&mut out, image, insets.left as i64, insets.top as i64);
    Ok((out, insets))
}

// ============================================================================
// Statistics Panel
// ============================================================================

/// Font sizes and rows of the statistics panel, all relative to the bottom
/// border's height.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StatsLayout {
    title_px: f32,
    number_px: f32,
    unit_px: f32,
    label_px: f32,
    title_y: i32,
    row_y: [i32; 2],
    label_gap: i32,
}

fn stats_layout(border_top: u32, border_height: u32) -> StatsLayout {
    let bh = border_height as f32;
    let at = |fraction: f32| border_top as i32 + (bh * fraction).round() as i32;
    StatsLayout {
        title_px: bh * 0.15,
        number_px: bh * 0.17,
        unit_px: bh * 0.11,
        label_px: bh * 0.085,
        title_y: at(0.15),
        row_y: [at(0.42), at(0.65)],
        label_gap: (bh * 0.05).round() as i32,
    }
}

/// Burn the statistics panel into the bottom border of a bordered image.
pub fn draw_stats_panel(image: &mut RgbaImage, insets: &BorderInsets, panel: &StatsPanel, fonts: &Fonts) {
    if insets.bottom == 0 {
        return;
    }
    let width = image.width();
    let layout = stats_layout(image.height() - insets.bottom, insets.bottom);

    let (title_w, _) = text_size(layout.title_px, &fonts.regular, &panel.title);
    let title_x = (width as i32 - title_w as i32) / 2;
    draw_text_mut(image, TITLE_COLOR, title_x, layout.title_y, layout.title_px, &fonts.regular, &panel.title);

    let col_width = width as f32 / 3.0;
    for (row, y) in panel.rows.iter().zip(layout.row_y) {
        for (i, cell) in row.iter().enumerate() {
            let centre = (col_width * (i as f32 + 0.5)) as i32;
            draw_cell(image, cell, centre, y, &layout, fonts);
        }
    }
}

fn draw_cell(image: &mut RgbaImage, cell: &StatCell, centre: i32, y: i32, layout: &StatsLayout, fonts: &Fonts) {
    let (number_w, number_h) = text_size(layout.number_px, &fonts.bold, &cell.number);
    let unit_w = if cell.unit.is_empty() {
        0
    } else {
        text_size(layout.unit_px, &fonts.regular, &cell.unit).0
    };

    let number_x = centre - (number_w + unit_w) as i32 / 2;
    draw_text_mut(image, NUMBER_COLOR, number_x, y, layout.number_px, &fonts.bold, &cell.number);
    if unit_w > 0 {
        draw_text_mut(
            image,
            NUMBER_COLOR,
            number_x + number_w as i32,
            y,
            layout.unit_px,
            &fonts.regular,
            &cell.unit,
        );
    }

    let (label_w, _) = text_size(layout.label_px, &fonts.regular, &cell.label);
    let label_y = y + number_h as i32 + layout.label_gap;
    draw_text_mut(
        image,
        LABEL_COLOR,
        centre - label_w as i32 / 2,
        label_y,
        layout.label_px,
        &fonts.regular,
        &cell.label,
    );
}

// ============================================================================
// Title Overlay
// ============================================================================

/// Image corner a title overlay is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corner {
    #[default]
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Corner {
    /// Top-left position of a `panel` placed `margin` pixels in from this
    /// corner of `canvas`.
    pub fn anchor(&self, canvas: (u32, u32), panel: (u32, u32), margin: u32) -> (u32, u32) {
        let right = canvas.0.saturating_sub(panel.0 + margin);
        let bottom = canvas.1.saturating_sub(panel.1 + margin);
        match self {
            Corner::TopLeft => (margin, margin),
            Corner::TopRight => (right, margin),
            Corner::BottomLeft => (margin, bottom),
            Corner::BottomRight => (right, bottom),
        }
    }
}

/// Configuration for title overlays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Default: top_left
    pub corner: Corner,
    /// Default: true
    pub show_title: bool,
    /// Draw the profile photo when one is supplied.
    /// Default: true
    pub show_photo: bool,
    /// Default: true
    pub show_distance: bool,
    /// Default: true
    pub show_time: bool,
    /// Default: metric
    pub units: Units,
    /// Default: "#000000"
    pub panel_color: String,
    /// Default: 0.55
    pub panel_opacity: f32,
    /// Default: "white"
    pub text_color: String,
    /// Starting title height as a fraction of image width.
    /// Default: 0.05
    pub title_scale: f32,
    /// Widest the panel may get, as a fraction of image width.
    /// Default: 0.6
    pub max_width: f32,
    /// Distance from the corner as a fraction of the shorter image side.
    /// Default: 0.03
    pub margin: f32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            corner: Corner::TopLeft,
            show_title: true,
            show_photo: true,
            show_distance: true,
            show_time: true,
            units: Units::Metric,
            panel_color: "#000000".to_string(),
            panel_opacity: 0.55,
            text_color: "white".to_string(),
            title_scale: 0.05,
            max_width: 0.6,
            margin: 0.03,
        }
    }
}

/// Title, figures and photo for a corner overlay.
#[derive(Debug, Clone, Default)]
pub struct TitleOverlay {
    pub title: String,
    /// Meters
    pub distance: Option<f64>,
    /// Seconds
    pub moving_time: Option<f64>,
    pub photo: Option<RgbaImage>,
}

impl TitleOverlay {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn for_activity(activity: &Activity) -> Self {
        Self {
            title: activity.name.clone(),
            // Fall back to the trace length when no distance was recorded.
            distance: Some(activity.distance)
                .filter(|d| *d > 0.0)
                .or_else(|| Some(polyline_length(&activity.points)).filter(|d| *d > 0.0)),
            moving_time: Some(activity.moving_time).filter(|t| *t > 0.0),
            photo: None,
        }
    }

    pub fn with_photo(mut self, photo: RgbaImage) -> Self {
        self.photo = Some(photo);
        self
    }

    /// `12.3 km | 1h 2m 3s`, with the enabled parts that are known.
    pub fn info_line(&self, config: &OverlayConfig) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(distance) = self.distance.filter(|_| config.show_distance) {
            parts.push(format!(
                "{:.1} {}",
                config.units.distance(distance),
                config.units.distance_unit()
            ));
        }
        if let Some(time) = self.moving_time.filter(|_| config.show_time) {
            parts.push(format_duration(time));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" | "))
        }
    }

    /// Draw the overlay onto `image`. The title shrinks until the panel fits
    /// within `config.max_width`.
    pub fn draw(&self, image: &mut RgbaImage, config: &OverlayConfig, fonts: &Fonts) -> Result<()> {
        let title = Some(self.title.as_str()).filter(|t| config.show_title && !t.is_empty());
        let info = self.info_line(config);
        let photo = self.photo.as_ref().filter(|_| config.show_photo);
        if title.is_none() && info.is_none() && photo.is_none() {
            return Ok(());
        }

        let panel_color = parse_color(&config.panel_color)?;
        let text_color = parse_color(&config.text_color)?;
        let (width, height) = image.dimensions();

        let base_px = (width as f32 * config.title_scale).max(MIN_TITLE_PX);
        let padding = (base_px * 0.5) as u32;
        let gap = (base_px * 0.25) as u32;
        let info_base = base_px * 0.6;
        let margin = (width.min(height) as f32 * config.margin) as u32;

        let content_h = title.map_or(0.0, |_| base_px)
            + info.as_ref().map_or(0.0, |_| info_base)
            + if title.is_some() && info.is_some() { gap as f32 } else { 0.0 };
        let diameter = photo.map_or(0, |_| (content_h as u32).max(base_px as u32));
        let photo_w = if diameter > 0 { diameter + padding } else { 0 };

        let max_panel_w = (width as f32 * config.max_width) as u32;
        let available = max_panel_w.saturating_sub(2 * padding + photo_w);

        let title_px = title.map(|t| {
            fit_font_size(base_px, MIN_TITLE_PX, available, |s| text_size(s, &fonts.bold, t).0)
        });
        let info_px = info.as_deref().map(|t| {
            fit_font_size(info_base, MIN_TITLE_PX * 0.6, available, |s| text_size(s, &fonts.regular, t).0)
        });

        let title_w = match (title, title_px) {
            (Some(t), Some(px)) => text_size(px, &fonts.bold, t).0,
            _ => 0,
        };
        let info_w = match (info.as_deref(), info_px) {
            (Some(t), Some(px)) => text_size(px, &fonts.regular, t).0,
            _ => 0,
        };
        let text_w = title_w.max(info_w);

        let inner_h = (content_h as u32).max(diameter);
        let panel = (
            2 * padding + photo_w + text_w,
            2 * padding + inner_h,
        );
        let (x, y) = config.corner.anchor((width, height), panel, margin);

        shade_rect(image, x, y, panel.0, panel.1, panel_color, config.panel_opacity);
        if let Some(photo) = photo {
            paste_circular(image, photo, x + padding, y + padding, diameter);
        }

        let text_x = (x + padding + photo_w) as i32;
        let mut text_y = (y + padding) as i32;
        if let (Some(t), Some(px)) = (title, title_px) {
            draw_text_mut(image, text_color, text_x, text_y, px, &fonts.bold, t);
            text_y += base_px as i32 + gap as i32;
        }
        if let (Some(t), Some(px)) = (info.as_deref(), info_px) {
            draw_text_mut(image, text_color, text_x, text_y, px, &fonts.regular, t);
        }
        Ok(())
    }
}

/// A title overlay as it appears in a render configuration. The renderer
/// fetches `photo_url` and loads `fonts` when drawing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySpec {
    /// Default: ""
    pub title: String,

    /// Meters.
    /// Default: None
    pub distance: Option<f64>,

    /// Seconds.
    /// Default: None
    pub moving_time: Option<f64>,

    /// Profile photo shown beside the title when `style.show_photo` is set.
    /// Default: None
    pub photo_url: Option<String>,

    pub style: OverlayConfig,

    pub fonts: FontSource,
}

impl OverlaySpec {
    pub fn for_activity(activity: &Activity) -> Self {
        let overlay = TitleOverlay::for_activity(activity);
        Self {
            title: overlay.title,
            distance: overlay.distance,
            moving_time: overlay.moving_time,
            ..Default::default()
        }
    }

    pub fn to_overlay(&self, photo: Option<RgbaImage>) -> TitleOverlay {
        TitleOverlay {
            title: self.title.clone(),
            distance: self.distance,
            moving_time: self.moving_time,
            photo,
        }
    }
}

/// Shrink by 10% steps from `start` until `measure` fits `available`, or
/// `min` is reached.
fn fit_font_size(start: f32, min: f32, available: u32, measure: impl Fn(f32) -> u32) -> f32 {
    let mut size = start.max(min);
    while size > min && measure(size) > available {
        size = (size * 0.9).max(min);
    }
    size
}

/// Blend `color` over a rectangle with the given opacity, clipped to the
/// image.
pub fn shade_rect(image: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Rgba<u8>, opacity: f32) {
    let a = opacity.clamp(0.0, 1.0);
    let x_end = (x + w).min(image.width());
    let y_end = (y + h).min(image.height());
    for py in y..y_end {
        for px in x..x_end {
            let p = image.get_pixel_mut(px, py);
            for c in 0..3 {
                p[c] = (p[c] as f32 * (1.0 - a) + color[c] as f32 * a).round() as u8;
            }
        }
    }
}

/// Paste `photo`, cover-fitted and masked to a circle, with its bounding
/// square's top-left at `(x, y)`. The circle edge is anti-aliased.
pub fn paste_circular(image: &mut RgbaImage, photo: &RgbaImage, x: u32, y: u32, diameter: u32) {
    if diameter == 0 {
        return;
    }
    let fitted = cover_fit(photo, diameter, diameter);
    let r = diameter as f32 / 2.0;
    for (i, j, src) in fitted.enumerate_pixels() {
        let (tx, ty) = (x + i, y + j);
        if tx >= image.width() || ty >= image.height() {
            continue;
        }
        let dx = i as f32 + 0.5 - r;
        let dy = j as f32 + 0.5 - r;
        let coverage = (r - (dx * dx + dy * dy).sqrt() + 0.5).clamp(0.0, 1.0) * (src[3] as f32 / 255.0);
        if coverage <= 0.0 {
            continue;
        }
        let dst = image.get_pixel_mut(tx, ty);
        for c in 0..3 {
            dst[c] = (dst[c] as f32 * (1.0 - coverage) + src[c] as f32 * coverage).round() as u8;
        }
    }
}
