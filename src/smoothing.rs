//! # Path Smoothing
//!
//! Turns a jittery GPS trace into a visually smooth polyline.
//!
//! | Method | Minimum points | Output length |
//! |--------|----------------|---------------|
//! | [`Smoothing::None`] | - | input length |
//! | [`Smoothing::MovingAverage`] | `window_size` | input length |
//! | [`Smoothing::Gaussian`] | 3 | input length |
//! | [`Smoothing::Spline`] | 4 | `num_points` (default input length) |
//!
//! Smoothing never fails. Traces below a method's minimum come back unchanged,
//! and a spline that cannot be fitted falls back to the input.
//!
//! ## Presets
//!
//! | Preset | Resolves to |
//! |--------|-------------|
//! | `none` | no smoothing |
//! | `light` | Gaussian, sigma 0.8 |
//! | `medium` | Gaussian, sigma 2.0 |
//! | `heavy` | Gaussian, sigma 4.0 |
//! | `strava` | interpolating cubic spline |
//!
//! ## Configuration
//!
//! [`SmoothingSpec`] deserializes from either a preset name or an explicit
//! method object:
//!
//! ```rust
//! use route_canvas::{Smoothing, SmoothingSpec};
//!
//! let preset: SmoothingSpec = serde_json::from_str(r#""heavy""#).unwrap();
//! assert_eq!(preset.resolve(), Smoothing::Gaussian { sigma: 4.0 });
//!
//! let explicit: SmoothingSpec =
//!     serde_json::from_str(r#"{"method": "moving_average", "window_size": 7}"#).unwrap();
//! assert_eq!(explicit.resolve(), Smoothing::MovingAverage { window_size: 7 });
//! ```

use std::fmt;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{Error, GpsPoint};

/// Gaussian kernels extend this many standard deviations either side.
const GAUSSIAN_TRUNCATE: f64 = 4.0;

/// Bisection steps when matching a spline's residual target.
const SPLINE_SEARCH_STEPS: usize = 60;

// ============================================================================
// Configuration
// ============================================================================

/// A concrete smoothing algorithm with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Smoothing {
    None,
    /// Centered window average; the window shrinks at both ends.
    MovingAverage {
        #[serde(default = "default_window_size")]
        window_size: usize,
    },
    /// Gaussian convolution applied to latitude and longitude independently.
    Gaussian {
        #[serde(default = "default_sigma")]
        sigma: f64,
    },
    /// Cubic smoothing spline over an index-uniform parameter.
    ///
    /// `smoothing_factor` bounds the sum of squared residuals per channel;
    /// 0 interpolates every input point.
    Spline {
        #[serde(default)]
        smoothing_factor: f64,
        #[serde(default)]
        num_points: Option<usize>,
    },
}

fn default_window_size() -> usize {
    5
}

fn default_sigma() -> f64 {
    2.0
}

/// Named shorthand for a fixed [`Smoothing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingPreset {
    None,
    Light,
    Medium,
    Heavy,
    Strava,
}

impl SmoothingPreset {
    pub const ALL: [SmoothingPreset; 5] = [
        SmoothingPreset::None,
        SmoothingPreset::Light,
        SmoothingPreset::Medium,
        SmoothingPreset::Heavy,
        SmoothingPreset::Strava,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SmoothingPreset::None => "none",
            SmoothingPreset::Light => "light",
            SmoothingPreset::Medium => "medium",
            SmoothingPreset::Heavy => "heavy",
            SmoothingPreset::Strava => "strava",
        }
    }

    /// The algorithm and parameters this preset stands for.
    pub fn resolve(&self) -> Smoothing {
        match self {
            SmoothingPreset::None => Smoothing::None,
            SmoothingPreset::Light => Smoothing::Gaussian { sigma: 0.8 },
            SmoothingPreset::Medium => Smoothing::Gaussian { sigma: 2.0 },
            SmoothingPreset::Heavy => Smoothing::Gaussian { sigma: 4.0 },
            SmoothingPreset::Strava => Smoothing::Spline {
                smoothing_factor: 0.0,
                num_points: None,
            },
        }
    }
}

impl fmt::Display for SmoothingPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SmoothingPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SmoothingPreset::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownSmoothing(s.to_string()))
    }
}

/// Either a preset name or an explicit method object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SmoothingSpec {
    Preset(SmoothingPreset),
    Explicit(Smoothing),
}

impl SmoothingSpec {
    pub fn resolve(&self) -> Smoothing {
        match self {
            SmoothingSpec::Preset(p) => p.resolve(),
            SmoothingSpec::Explicit(s) => s.clone(),
        }
    }
}

impl Default for SmoothingSpec {
    fn default() -> Self {
        SmoothingSpec::Preset(SmoothingPreset::Medium)
    }
}

impl From<SmoothingPreset> for SmoothingSpec {
    fn from(preset: SmoothingPreset) -> Self {
        SmoothingSpec::Preset(preset)
    }
}

impl From<Smoothing> for SmoothingSpec {
    fn from(smoothing: Smoothing) -> Self {
        SmoothingSpec::Explicit(smoothing)
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Smooth a trace with the given algorithm.
pub fn smooth(points: &[GpsPoint], smoothing: &Smoothing) -> Vec<GpsPoint> {
    match smoothing {
        Smoothing::None => points.to_vec(),
        Smoothing::MovingAverage { window_size } => moving_average(points, *window_size),
        Smoothing::Gaussian { sigma } => gaussian(points, *sigma),
        Smoothing::Spline {
            smoothing_factor,
            num_points,
        } => spline(points, *smoothing_factor, num_points.unwrap_or(points.len())),
    }
}

/// Smooth several traces with the same algorithm.
#[cfg(not(feature = "parallel"))]
pub fn smooth_many(traces: &[Vec<GpsPoint>], smoothing: &Smoothing) -> Vec<Vec<GpsPoint>> {
    traces.iter().map(|t| smooth(t, smoothing)).collect()
}

/// Smooth several traces with the same algorithm, one rayon task per trace.
#[cfg(feature = "parallel")]
pub fn smooth_many(traces: &[Vec<GpsPoint>], smoothing: &Smoothing) -> Vec<Vec<GpsPoint>> {
    use rayon::prelude::*;

    traces.par_iter().map(|t| smooth(t, smoothing)).collect()
}

// ============================================================================
// Moving Average
// ============================================================================

/// Centered moving average. Near the ends the window covers only the
/// neighbours that exist, so no padding or wraparound is introduced.
pub fn moving_average(points: &[GpsPoint], window_size: usize) -> Vec<GpsPoint> {
    let n = points.len();
    if window_size == 0 || n < window_size {
        return points.to_vec();
    }

    let half = window_size / 2;
    (0..n)
        .map(|i| {
            let start = i.saturating_sub(half);
            let end = (i + half + 1).min(n);
            let window = &points[start..end];
            let count = window.len() as f64;
            let (lat, lng) = window
                .iter()
                .fold((0.0, 0.0), |(lat, lng), p| (lat + p.latitude, lng + p.longitude));
            GpsPoint::new(lat / count, lng / count)
        })
        .collect()
}

// ============================================================================
// Gaussian
// ============================================================================

/// Gaussian convolution of each channel with mirror-reflected edges
/// (`d c b a | a b c d | d c b a`).
pub fn gaussian(points: &[GpsPoint], sigma: f64) -> Vec<GpsPoint> {
    if points.len() < 3 || !(sigma > 0.0) || !sigma.is_finite() {
        return points.to_vec();
    }

    let kernel = gaussian_kernel(sigma);
    let lats: Vec<f64> = points.iter().map(|p| p.latitude).collect();
    let lngs: Vec<f64> = points.iter().map(|p| p.longitude).collect();
    let lats = convolve_reflect(&lats, &kernel);
    let lngs = convolve_reflect(&lngs, &kernel);

    lats.into_iter()
        .zip(lngs)
        .map(|(lat, lng)| GpsPoint::new(lat, lng))
        .collect()
}

/// Normalized kernel of radius `round(4 * sigma)`.
fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (GAUSSIAN_TRUNCATE * sigma + 0.5) as i64;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|k| (-0.5 * (k as f64 / sigma).powi(2)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Map any index onto `[0, n)` by repeated mirror reflection.
fn reflect_index(i: i64, n: usize) -> usize {
    let n = n as i64;
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m >= n { period - 1 - m } else { m }) as usize
}

fn convolve_reflect(values: &[f64], kernel: &[f64]) -> Vec<f64> {
    let n = values.len();
    let radius = (kernel.len() / 2) as i64;
    (0..n as i64)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * values[reflect_index(i + k as i64 - radius, n)])
                .sum()
        })
        .collect()
}

// ============================================================================
// Cubic Smoothing Spline
// ============================================================================

/// Fit a cubic smoothing spline to each channel over the sample index and
/// evaluate it at `num_points` evenly spaced parameters.
///
/// The parameter is index-uniform, not arc-length, so densely sampled slow
/// sections pull harder on the curve than sparse fast ones.
pub fn spline(points: &[GpsPoint], smoothing_factor: f64, num_points: usize) -> Vec<GpsPoint> {
    if points.len() < 4 || num_points == 0 {
        return points.to_vec();
    }

    let lats: Vec<f64> = points.iter().map(|p| p.latitude).collect();
    let lngs: Vec<f64> = points.iter().map(|p| p.longitude).collect();

    let fitted = CubicSpline::fit(&lats, smoothing_factor)
        .zip(CubicSpline::fit(&lngs, smoothing_factor));
    let Some((lat_spline, lng_spline)) = fitted else {
        debug!("[Smoothing] Spline fit failed for {} points, using raw trace", points.len());
        return points.to_vec();
    };

    let last = (points.len() - 1) as f64;
    let out: Vec<GpsPoint> = (0..num_points)
        .map(|j| {
            let u = if num_points == 1 {
                0.0
            } else {
                j as f64 * last / (num_points - 1) as f64
            };
            GpsPoint::new(lat_spline.eval(u), lng_spline.eval(u))
        })
        .collect();

    if out.iter().all(|p| p.latitude.is_finite() && p.longitude.is_finite()) {
        out
    } else {
        debug!("[Smoothing] Spline produced non-finite values, using raw trace");
        points.to_vec()
    }
}

/// Natural cubic spline in value/second-derivative form on unit knot spacing.
struct CubicSpline {
    values: Vec<f64>,
    second: Vec<f64>,
}

impl CubicSpline {
    /// Reinsch fit: minimise `sum (y - g)^2 + lambda * int g''^2`, choosing
    /// `lambda` so the residual sum of squares meets `target`.
    fn fit(y: &[f64], target: f64) -> Option<Self> {
        if y.iter().any(|v| !v.is_finite()) || !target.is_finite() {
            return None;
        }
        if target <= 0.0 {
            return Self::solve(y, 0.0).map(|(s, _)| s);
        }

        let n = y.len() as f64;
        let mut lo = -6.0_f64;
        let mut hi = 4.0 * n.log10() + 2.0;

        let (stiff, stiff_rss) = Self::solve(y, 10f64.powf(hi))?;
        if stiff_rss <= target {
            return Some(stiff);
        }

        let mut best = Self::solve(y, 10f64.powf(lo))?;
        if best.1 > target {
            return Some(best.0);
        }
        for _ in 0..SPLINE_SEARCH_STEPS {
            let mid = 0.5 * (lo + hi);
            let candidate = Self::solve(y, 10f64.powf(mid))?;
            if candidate.1 <= target {
                lo = mid;
                best = candidate;
            } else {
                hi = mid;
            }
        }
        Some(best.0)
    }

    /// Solve `(R + lambda Q^T Q) gamma = Q^T y` and return the spline with its
    /// residual sum of squares.
    fn solve(y: &[f64], lambda: f64) -> Option<(Self, f64)> {
        let n = y.len();
        let m = n - 2;

        // Q^T y is the second difference of y.
        let rhs: Vec<f64> = (0..m).map(|k| y[k] - 2.0 * y[k + 1] + y[k + 2]).collect();

        // Symmetric pentadiagonal system: R has 2/3 on the diagonal and 1/6
        // beside it; Q^T Q has 6, -4, 1.
        let diag = vec![2.0 / 3.0 + 6.0 * lambda; m];
        let off1 = vec![1.0 / 6.0 - 4.0 * lambda; m.saturating_sub(1)];
        let off2 = vec![lambda; m.saturating_sub(2)];
        let gamma = solve_pentadiagonal(&diag, &off1, &off2, &rhs)?;

        let q_gamma: Vec<f64> = (0..n)
            .map(|j| {
                let at = |k: isize| -> f64 {
                    if k >= 0 && (k as usize) < m {
                        gamma[k as usize]
                    } else {
                        0.0
                    }
                };
                let j = j as isize;
                at(j) - 2.0 * at(j - 1) + at(j - 2)
            })
            .collect();

        let values: Vec<f64> = y
            .iter()
            .zip(&q_gamma)
            .map(|(yi, qg)| yi - lambda * qg)
            .collect();
        let rss = lambda * lambda * q_gamma.iter().map(|v| v * v).sum::<f64>();

        let mut second = Vec::with_capacity(n);
        second.push(0.0);
        second.extend_from_slice(&gamma);
        second.push(0.0);

        Some((Self { values, second }, rss))
    }

    /// Evaluate at index-space position `u` in `[0, n - 1]`.
    fn eval(&self, u: f64) -> f64 {
        let last = self.values.len() - 1;
        let u = u.clamp(0.0, last as f64);
        let i = (u.floor() as usize).min(last - 1);
        let a = (i + 1) as f64 - u;
        let b = 1.0 - a;
        a * self.values[i]
            + b * self.values[i + 1]
            + ((a * a * a - a) * self.second[i] + (b * b * b - b) * self.second[i + 1]) / 6.0
    }
}

/// Banded Cholesky solve of a symmetric positive-definite pentadiagonal
/// system. Returns `None` when a pivot is not positive.
fn solve_pentadiagonal(diag: &[f64], off1: &[f64], off2: &[f64], rhs: &[f64]) -> Option<Vec<f64>> {
    let m = diag.len();
    // l[i] = (L[i][i], L[i][i-1], L[i][i-2])
    let mut l = vec![(0.0_f64, 0.0_f64, 0.0_f64); m];

    for i in 0..m {
        let l2 = if i >= 2 { off2[i - 2] / l[i - 2].0 } else { 0.0 };
        let l1 = if i >= 1 {
            let carried = if i >= 2 { l2 * l[i - 1].1 } else { 0.0 };
            (off1[i - 1] - carried) / l[i - 1].0
        } else {
            0.0
        };
        let pivot = diag[i] - l1 * l1 - l2 * l2;
        if !(pivot > 0.0) || !pivot.is_finite() {
            return None;
        }
        l[i] = (pivot.sqrt(), l1, l2);
    }

    let mut z = vec![0.0; m];
    for i in 0..m {
        let mut acc = rhs[i];
        if i >= 1 {
            acc -= l[i].1 * z[i - 1];
        }
        if i >= 2 {
            acc -= l[i].2 * z[i - 2];
        }
        z[i] = acc / l[i].0;
    }

    let mut x = vec![0.0; m];
    for i in (0..m).rev() {
        let mut acc = z[i];
        if i + 1 < m {
            acc -= l[i + 1].1 * x[i + 1];
        }
        if i + 2 < m {
            acc -= l[i + 2].2 * x[i + 2];
        }
        x[i] = acc / l[i].0;
    }
    Some(x)
}

// ============================================================================
// Tests
// ============================================================================
