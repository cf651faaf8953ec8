//! Colour parsing, the activity palette, and photographic tone adjustment.

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Line colours cycled through when activities have no explicit colour.
pub const PALETTE: [&str; 10] = [
    "#FC4C02", "#0066CC", "#00CC66", "#CC0066", "#FF9900",
    "#9900CC", "#00CCCC", "#CC6600", "#FF0066", "#0099FF",
];

/// Default route colour.
pub const ROUTE_ORANGE: &str = "#FC4C02";

/// Parse `#RRGGBB`, `#RRGGBBAA`, `#RGB`, `white` or `black`.
pub fn parse_color(s: &str) -> Result<Rgba<u8>> {
    let trimmed = s.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "white" => return Ok(Rgba([255, 255, 255, 255])),
        "black" => return Ok(Rgba([0, 0, 0, 255])),
        _ => {}
    }

    let hex = trimmed
        .strip_prefix('#')
        .ok_or_else(|| Error::InvalidColor(s.to_string()))?;
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidColor(s.to_string()));
    }

    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16);
    match hex.len() {
        3 => {
            let digits: Vec<u8> = hex
                .chars()
                .filter_map(|c| c.to_digit(16))
                .map(|d| (d * 17) as u8)
                .collect();
            Ok(Rgba([digits[0], digits[1], digits[2], 255]))
        }
        6 => Ok(Rgba([
            channel(0).map_err(|_| Error::InvalidColor(s.to_string()))?,
            channel(2).map_err(|_| Error::InvalidColor(s.to_string()))?,
            channel(4).map_err(|_| Error::InvalidColor(s.to_string()))?,
            255,
        ])),
        8 => Ok(Rgba([
            channel(0).map_err(|_| Error::InvalidColor(s.to_string()))?,
            channel(2).map_err(|_| Error::InvalidColor(s.to_string()))?,
            channel(4).map_err(|_| Error::InvalidColor(s.to_string()))?,
            channel(6).map_err(|_| Error::InvalidColor(s.to_string()))?,
        ])),
        _ => Err(Error::InvalidColor(s.to_string())),
    }
}

/// Palette colour for the `index`-th activity, wrapping after ten.
pub fn palette_color(index: usize) -> Rgba<u8> {
    // Palette entries are literals known to parse.
    parse_color(PALETTE[index % PALETTE.len()]).unwrap_or(Rgba([252, 76, 2, 255]))
}

/// Same colour with a different alpha.
pub fn with_alpha(color: Rgba<u8>, alpha: f32) -> Rgba<u8> {
    let a = (color[3] as f32 * alpha.clamp(0.0, 1.0)).round() as u8;
    Rgba([color[0], color[1], color[2], a])
}

// ============================================================================
// Tone Adjustment
// ============================================================================

/// Saturation, brightness and contrast factors, applied in that order.
///
/// Each factor is 1.0 for "unchanged". Saturation blends toward the pixel's
/// luma, brightness toward black, and contrast toward the mean luma of the
/// whole image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneAdjustment {
    pub saturation: f32,
    pub brightness: f32,
    pub contrast: f32,
}

impl Default for ToneAdjustment {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl ToneAdjustment {
    pub const IDENTITY: ToneAdjustment = ToneAdjustment {
        saturation: 1.0,
        brightness: 1.0,
        contrast: 1.0,
    };

    /// Muted look applied to basemaps.
    pub const MINIMAL_BASEMAP: ToneAdjustment = ToneAdjustment {
        saturation: 0.15,
        brightness: 1.0,
        contrast: 0.85,
    };

    /// Darkened, desaturated look applied to photo backgrounds.
    pub const PHOTO_BACKDROP: ToneAdjustment = ToneAdjustment {
        saturation: 0.3,
        brightness: 0.7,
        contrast: 1.0,
    };

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Adjust `img` in place. Alpha is left untouched.
    pub fn apply(&self, img: &mut RgbaImage) {
        if self.is_identity() {
            return;
        }

        if self.saturation != 1.0 {
            let f = self.saturation;
            for px in img.pixels_mut() {
                let l = luma(px) as f32;
                for c in 0..3 {
                    px[c] = blend(l, px[c] as f32, f);
                }
            }
        }

        if self.brightness != 1.0 {
            let f = self.brightness;
            for px in img.pixels_mut() {
                for c in 0..3 {
                    px[c] = blend(0.0, px[c] as f32, f);
                }
            }
        }

        if self.contrast != 1.0 {
            let pixels = (img.width() as u64 * img.height() as u64).max(1);
            let total: u64 = img.pixels().map(|p| luma(p) as u64).sum();
            let mean = (total as f64 / pixels as f64 + 0.5).floor() as f32;
            let f = self.contrast;
            for px in img.pixels_mut() {
                for c in 0..3 {
                    px[c] = blend(mean, px[c] as f32, f);
                }
            }
        }
    }
}

/// ITU-R 601-2 luma.
fn luma(px: &Rgba<u8>) -> u8 {
    ((px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000) as u8
}

/// `base + factor * (value - base)`, rounded and clamped to a channel.
fn blend(base: f32, value: f32, factor: f32) -> u8 {
    (base + factor * (value - base)).round().clamp(0.0, 255.0) as u8
}
