//! Raster tile providers.
//!
//! This module provides:
//! - The [`TileSource`] trait the basemap assembler fetches through
//! - [`HttpTileProvider`], a slippy-map URL template served from one or more
//!   sub-domains, with dispatch rate limiting and 429 backoff
//! - [`BasemapStyle`], the named provider chains (primary first, fallbacks after)
//! - [`first_success`], the short-circuiting combinator behind provider fallback

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::projection::TileCoord;
use crate::Error;

/// Default spacing between request starts, per provider.
pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Per-request timeout for tile and photo downloads.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Sent with every tile request; tile servers reject anonymous clients.
pub const USER_AGENT: &str = concat!("route-canvas/", env!("CARGO_PKG_VERSION"));

/// Why one tile could not be fetched from one source.
#[derive(Debug, thiserror::Error)]
pub enum TileFetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("rate limited")]
    RateLimited,

    #[error("empty response body")]
    EmptyBody,

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Something that can produce encoded raster tiles.
///
/// `name` doubles as the tile-cache namespace, so two sources with the same
/// name share cached tiles.
#[async_trait]
pub trait TileSource: Send + Sync {
    fn name(&self) -> &str;

    /// Encoded image bytes for one tile.
    async fn fetch(&self, coord: TileCoord) -> Result<Vec<u8>, TileFetchError>;
}

// ============================================================================
// Rate Limiting
// ============================================================================

/// Spaces out when requests start, so a burst of tile fetches reaches a
/// provider at a steady rate however many are in flight.
pub(crate) struct DispatchRateLimiter {
    interval: Duration,
    next_dispatch: Mutex<Instant>,
    dispatched_count: AtomicU32,
    consecutive_429s: AtomicU32,
}

impl DispatchRateLimiter {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_dispatch: Mutex::new(Instant::now()),
            dispatched_count: AtomicU32::new(0),
            consecutive_429s: AtomicU32::new(0),
        }
    }

    /// Wait for this caller's slot. Slots are `interval` apart.
    pub(crate) async fn wait_for_dispatch_slot(&self) -> u32 {
        let (wait, dispatch_num) = {
            let mut next = self.next_dispatch.lock().await;
            let now = Instant::now();
            let dispatch_at = if *next > now { *next } else { now };
            *next = dispatch_at + self.interval;
            let num = self.dispatched_count.fetch_add(1, Ordering::Relaxed) + 1;
            (dispatch_at.saturating_duration_since(now), num)
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        dispatch_num
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_429s.store(0, Ordering::Relaxed);
    }

    /// Exponential backoff: 1s, 2s, 4s, then 4s.
    pub(crate) fn record_429(&self) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        Duration::from_millis(500 * (1 << count.min(3)))
    }
}

// ============================================================================
// HTTP Provider
// ============================================================================

/// A slippy-map tile server.
///
/// `url_template` may contain `{s}` (sub-domain), `{z}`, `{x}` and `{y}`.
/// Sub-domains are tried in order for each tile; any failure moves on to the
/// next one.
pub struct HttpTileProvider {
    name: String,
    url_template: String,
    subdomains: Vec<String>,
    client: Client,
    rate_limiter: Arc<DispatchRateLimiter>,
}

impl HttpTileProvider {
    pub fn new(name: &str, url_template: &str, subdomains: &[&str], client: Client) -> Self {
        Self {
            name: name.to_string(),
            url_template: url_template.to_string(),
            subdomains: subdomains.iter().map(|s| s.to_string()).collect(),
            client,
            rate_limiter: Arc::new(DispatchRateLimiter::new(DEFAULT_DISPATCH_INTERVAL)),
        }
    }

    /// Override the spacing between request starts.
    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.rate_limiter = Arc::new(DispatchRateLimiter::new(interval));
        self
    }

    /// URL of `coord` on one sub-domain.
    pub fn tile_url(&self, coord: TileCoord, subdomain: &str) -> String {
        self.url_template
            .replace("{s}", subdomain)
            .replace("{z}", &coord.zoom.to_string())
            .replace("{x}", &coord.x.to_string())
            .replace("{y}", &coord.y.to_string())
    }

    async fn fetch_from(&self, url: &str) -> Result<Vec<u8>, TileFetchError> {
        self.rate_limiter.wait_for_dispatch_slot().await;

        let resp = self.client.get(url).send().await?;
        let status = resp.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let wait = self.rate_limiter.record_429();
            warn!("[TileSource] {} rate limited, backing off {:?}", self.name, wait);
            tokio::time::sleep(wait).await;
            return Err(TileFetchError::RateLimited);
        }
        self.rate_limiter.record_success();

        if !status.is_success() {
            return Err(TileFetchError::Status(status.as_u16()));
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(TileFetchError::EmptyBody);
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl TileSource for HttpTileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, coord: TileCoord) -> Result<Vec<u8>, TileFetchError> {
        let subdomains: Vec<&str> = if self.subdomains.is_empty() {
            vec![""]
        } else {
            self.subdomains.iter().map(String::as_str).collect()
        };

        let mut last_err = TileFetchError::Unavailable("no sub-domains tried".to_string());
        for subdomain in subdomains {
            let url = self.tile_url(coord, subdomain);
            match self.fetch_from(&url).await {
                Ok(bytes) => {
                    debug!("[TileSource] {} -> {} bytes", url, bytes.len());
                    return Ok(bytes);
                }
                Err(e) => {
                    debug!("[TileSource] {} failed: {}", url, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

/// HTTP client shared by every provider and photo download.
pub fn default_client() -> crate::Result<Client> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .pool_idle_timeout(Duration::from_secs(60))
        .build()?;
    Ok(client)
}

// ============================================================================
// Styles
// ============================================================================

const CARTO_SUBDOMAINS: &[&str] = &["a", "b", "c", "d"];

/// Named basemap looks. Each is an ordered chain of providers: the first is
/// the look itself, the rest are fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasemapStyle {
    /// Label-free light map, muted further by tone adjustment
    #[default]
    Minimal,
    /// Light map with labels
    Light,
    /// Colourful label-free street map
    Voyager,
    /// Dark map
    Dark,
    /// Standard OpenStreetMap
    Osm,
}

/// Static description of one provider in a style chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSpec {
    pub name: &'static str,
    pub url_template: &'static str,
    pub subdomains: &'static [&'static str],
}

const POSITRON_NOLABELS: ProviderSpec = ProviderSpec {
    name: "CartoDB Positron NoLabels",
    url_template: "https://{s}.basemaps.cartocdn.com/light_nolabels/{z}/{x}/{y}.png",
    subdomains: CARTO_SUBDOMAINS,
};

const POSITRON: ProviderSpec = ProviderSpec {
    name: "CartoDB Positron",
    url_template: "https://{s}.basemaps.cartocdn.com/light_all/{z}/{x}/{y}.png",
    subdomains: CARTO_SUBDOMAINS,
};

const VOYAGER_NOLABELS: ProviderSpec = ProviderSpec {
    name: "CartoDB Voyager NoLabels",
    url_template: "https://{s}.basemaps.cartocdn.com/rastertiles/voyager_nolabels/{z}/{x}/{y}.png",
    subdomains: CARTO_SUBDOMAINS,
};

const DARK_MATTER: ProviderSpec = ProviderSpec {
    name: "CartoDB Dark Matter",
    url_template: "https://{s}.basemaps.cartocdn.com/dark_all/{z}/{x}/{y}.png",
    subdomains: CARTO_SUBDOMAINS,
};

const OSM: ProviderSpec = ProviderSpec {
    name: "OSM",
    url_template: "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
    subdomains: &[],
};

impl BasemapStyle {
    pub const ALL: [BasemapStyle; 5] = [
        BasemapStyle::Minimal,
        BasemapStyle::Light,
        BasemapStyle::Voyager,
        BasemapStyle::Dark,
        BasemapStyle::Osm,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            BasemapStyle::Minimal => "minimal",
            BasemapStyle::Light => "light",
            BasemapStyle::Voyager => "voyager",
            BasemapStyle::Dark => "dark",
            BasemapStyle::Osm => "osm",
        }
    }

    /// Provider chain, primary first.
    pub fn provider_specs(&self) -> &'static [ProviderSpec] {
        match self {
            BasemapStyle::Minimal => &[POSITRON_NOLABELS, VOYAGER_NOLABELS, OSM],
            BasemapStyle::Light => &[POSITRON, OSM],
            BasemapStyle::Voyager => &[VOYAGER_NOLABELS, POSITRON_NOLABELS, OSM],
            BasemapStyle::Dark => &[DARK_MATTER, OSM],
            BasemapStyle::Osm => &[OSM],
        }
    }

    /// Instantiate the provider chain on a shared client.
    pub fn providers(&self, client: &Client) -> Vec<Arc<dyn TileSource>> {
        self.provider_specs()
            .iter()
            .map(|spec| {
                Arc::new(HttpTileProvider::new(
                    spec.name,
                    spec.url_template,
                    spec.subdomains,
                    client.clone(),
                )) as Arc<dyn TileSource>
            })
            .collect()
    }
}

impl fmt::Display for BasemapStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for BasemapStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim().to_ascii_lowercase();
        BasemapStyle::ALL
            .into_iter()
            .find(|style| style.id() == id)
            .or(match id.as_str() {
                "positron" | "carto" => Some(BasemapStyle::Light),
                "dark_matter" => Some(BasemapStyle::Dark),
                "openstreetmap" => Some(BasemapStyle::Osm),
                _ => None,
            })
            .ok_or_else(|| Error::Runtime(format!("unknown basemap style: {}", s)))
    }
}

// ============================================================================
// Fallback
// ============================================================================

/// Try `candidates` in order and return the index and output of the first
/// attempt that yields `Some`. Later candidates are never attempted.
pub async fn first_success<'a, C, T, F, Fut>(candidates: &'a [C], mut attempt: F) -> Option<(usize, T)>
where
    F: FnMut(usize, &'a C) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for (index, candidate) in candidates.iter().enumerate() {
        if let Some(out) = attempt(index, candidate).await {
            return Some((index, out));
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_slots_are_spaced() {
        let limiter = DispatchRateLimiter::new(Duration::from_millis(50));

        let start = Instant::now();
        assert_eq!(limiter.wait_for_dispatch_slot().await, 1);
        assert!(start.elapsed() < Duration::from_millis(30));

        let start = Instant::now();
        assert_eq!(limiter.wait_for_dispatch_slot().await, 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "expected ~50ms wait, got {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_zero_interval_never_waits() {
        let limiter = DispatchRateLimiter::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..20 {
            limiter.wait_for_dispatch_slot().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let limiter = DispatchRateLimiter::new(Duration::ZERO);
        assert_eq!(limiter.record_429(), Duration::from_millis(1000));
        assert_eq!(limiter.record_429(), Duration::from_millis(2000));
        assert_eq!(limiter.record_429(), Duration::from_millis(4000));
        assert_eq!(limiter.record_429(), Duration::from_millis(4000));
        limiter.record_success();
        assert_eq!(limiter.record_429(), Duration::from_millis(1000));
    }

    #[test]
    fn test_tile_url() {
        let provider = HttpTileProvider::new(
            POSITRON_NOLABELS.name,
            POSITRON_NOLABELS.url_template,
            POSITRON_NOLABELS.subdomains,
            Client::new(),
        )
        .with_dispatch_interval(Duration::ZERO);
        let url = provider.tile_url(TileCoord::new(12, 655, 1583), "b");
        assert_eq!(
            url,
            "https://b.basemaps.cartocdn.com/light_nolabels/12/655/1583.png"
        );
        assert_eq!(provider.name(), "CartoDB Positron NoLabels");
    }

    #[test]
    fn test_style_chains() {
        let minimal: Vec<_> = BasemapStyle::Minimal
            .provider_specs()
            .iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(
            minimal,
            vec!["CartoDB Positron NoLabels", "CartoDB Voyager NoLabels", "OSM"]
        );
        for style in BasemapStyle::ALL {
            assert!(!style.provider_specs().is_empty());
            assert_eq!(style.providers(&Client::new()).len(), style.provider_specs().len());
        }
    }

    #[test]
    fn test_style_parse() {
        for style in BasemapStyle::ALL {
            assert_eq!(style.id().parse::<BasemapStyle>().unwrap(), style);
        }
        assert_eq!(" Dark ".parse::<BasemapStyle>().unwrap(), BasemapStyle::Dark);
        assert_eq!("openstreetmap".parse::<BasemapStyle>().unwrap(), BasemapStyle::Osm);
        assert!("satellite".parse::<BasemapStyle>().is_err());
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let mut attempted = Vec::new();
        let result = first_success(&["a", "b", "c", "d"], |i, name| {
            attempted.push(*name);
            let out = if i >= 1 { Some(name.to_uppercase()) } else { None };
            async move { out }
        })
        .await;

        assert_eq!(result, Some((1, "B".to_string())));
        assert_eq!(attempted, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_first_success_all_fail() {
        let result: Option<(usize, ())> =
            first_success(&[1, 2, 3], |_, _| async { None }).await;
        assert!(result.is_none());
    }
}
