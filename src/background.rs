//! Canvas backgrounds: a solid colour, a toned-down photo, or a basemap.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::color::ToneAdjustment;
use crate::tile_source::{BasemapStyle, REQUEST_TIMEOUT};

/// Blur applied to photo backgrounds so the route stays readable.
pub const PHOTO_BLUR_SIGMA: f32 = 2.0;

/// What sits underneath the route.
///
/// Photo and basemap backgrounds fall back to `fallback_color` of the render
/// configuration when they cannot be produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Background {
    /// Plain fill with the configured background colour
    Solid,
    /// A remote photo, desaturated, darkened, blurred and cover-fitted
    Photo { url: String },
    /// Web-Mercator tiles aligned with the route
    Basemap {
        #[serde(default)]
        style: BasemapStyle,
    },
}

impl Default for Background {
    fn default() -> Self {
        Background::Basemap {
            style: BasemapStyle::Minimal,
        }
    }
}

/// Canvas filled with one opaque colour.
pub fn solid(width: u32, height: u32, color: Rgba<u8>) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba([color[0], color[1], color[2], 255]))
}

/// Download and decode an image. Any failure is logged and yields `None`.
pub async fn download_image(client: &Client, url: &str) -> Option<RgbaImage> {
    let resp = match client.get(url).timeout(REQUEST_TIMEOUT).send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("[Background] Photo request failed for {}: {}", url, e);
            return None;
        }
    };
    if !resp.status().is_success() {
        warn!("[Background] Photo {} returned HTTP {}", url, resp.status());
        return None;
    }
    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("[Background] Photo body failed for {}: {}", url, e);
            return None;
        }
    };
    match image::load_from_memory(&bytes) {
        Ok(img) => {
            debug!("[Background] Photo {} decoded {}x{}", url, img.width(), img.height());
            Some(img.to_rgba8())
        }
        Err(e) => {
            warn!("[Background] Photo {} undecodable: {}", url, e);
            None
        }
    }
}

/// Tone down a photo and cover-fit it to the canvas.
pub fn photo_backdrop(photo: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let mut toned = photo.clone();
    ToneAdjustment::PHOTO_BACKDROP.apply(&mut toned);
    let blurred = imageops::blur(&toned, PHOTO_BLUR_SIGMA);
    let mut fitted = cover_fit(&blurred, width, height);
    for px in fitted.pixels_mut() {
        px[3] = 255;
    }
    fitted
}

/// Scale to cover `width x height` while keeping the aspect ratio, then crop
/// the centre.
pub fn cover_fit(img: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let (iw, ih) = img.dimensions();
    if iw == 0 || ih == 0 {
        return RgbaImage::new(width, height);
    }
    let scale = (width as f64 / iw as f64).max(height as f64 / ih as f64);
    let sw = ((iw as f64 * scale).ceil() as u32).max(width);
    let sh = ((ih as f64 * scale).ceil() as u32).max(height);

    let scaled = imageops::resize(img, sw, sh, FilterType::Lanczos3);
    let left = (sw - width) / 2;
    let top = (sh - height) / 2;
    imageops::crop_imm(&scaled, left, top, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_is_opaque() {
        let img = solid(3, 2, Rgba([10, 20, 30, 0]));
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(2, 1), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn test_cover_fit_crops_centre_of_wide_image() {
        // Left third red, middle green, right third blue
        let mut img = RgbaImage::new(300, 100);
        for (x, _, px) in img.enumerate_pixels_mut() {
            *px = match x {
                0..=99 => Rgba([255, 0, 0, 255]),
                100..=199 => Rgba([0, 255, 0, 255]),
                _ => Rgba([0, 0, 255, 255]),
            };
        }
        let fitted = cover_fit(&img, 50, 50);
        assert_eq!(fitted.dimensions(), (50, 50));
        let centre = fitted.get_pixel(25, 25);
        assert!(centre[1] > 200 && centre[0] < 50 && centre[2] < 50);
    }

    #[test]
    fn test_cover_fit_upscales_small_image() {
        let img = RgbaImage::from_pixel(10, 20, Rgba([7, 7, 7, 255]));
        let fitted = cover_fit(&img, 100, 100);
        assert_eq!(fitted.dimensions(), (100, 100));
    }

    #[test]
    fn test_photo_backdrop_darkens_and_fits() {
        let photo = RgbaImage::from_pixel(64, 48, Rgba([200, 200, 200, 255]));
        let out = photo_backdrop(&photo, 40, 40);
        assert_eq!(out.dimensions(), (40, 40));
        let px = out.get_pixel(20, 20);
        assert!((px[0] as i32 - 140).abs() <= 2);
        assert_eq!(px[3], 255);
    }

    #[test]
    fn test_background_deserialize() {
        let bg: Background = serde_json::from_str(r#"{"mode": "photo", "url": "http://x/y.jpg"}"#).unwrap();
        assert_eq!(bg, Background::Photo { url: "http://x/y.jpg".into() });
        let bg: Background = serde_json::from_str(r#"{"mode": "basemap"}"#).unwrap();
        assert_eq!(bg, Background::Basemap { style: BasemapStyle::Minimal });
        let bg: Background = serde_json::from_str(r#"{"mode": "solid"}"#).unwrap();
        assert_eq!(bg, Background::Solid);
    }
}
