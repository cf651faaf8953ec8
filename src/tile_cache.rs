//! # Tile Cache
//!
//! Disk-backed store for downloaded raster tiles, keyed by
//! `(provider, zoom, x, y)`.
//!
//! Entries live at `<root>/<provider>/<zoom>/<x>/<hash>.png`, where `<hash>` is
//! a 128-bit SipHash of the full key. The tree is plain files, so an operator
//! can browse or delete it by hand.
//!
//! Reads treat anything unusable as a miss: absent, older than the TTL, or
//! failing to decode (a torn write from a concurrent process looks like
//! this). Corrupt and expired entries are deleted on sight. Writes go to a
//! temporary file that is renamed into place, and a failed write is logged
//! and otherwise ignored.

use std::fs;
use std::hash::Hasher;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use image::RgbaImage;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use siphasher::sip128::{Hasher128, SipHasher13};
use walkdir::WalkDir;

use crate::projection::TileCoord;

/// Entries older than this are refetched.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const TILE_EXTENSION: &str = "png";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Tile count and on-disk size of a cache (or one provider's part of it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub tiles: usize,
    pub bytes: u64,
}

/// Disk tile cache. Cheap to clone; holds only its root and TTL.
#[derive(Debug, Clone)]
pub struct TileCache {
    root: PathBuf,
    ttl: Duration,
}

impl TileCache {
    /// Cache rooted at `root` with the default 30 day TTL.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_ttl(root, DEFAULT_TTL)
    }

    pub fn with_ttl(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    /// Cache under the system temp directory, shared by every process of
    /// this user.
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join("route-canvas").join("tiles"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Where the entry for this key lives (whether or not it exists).
    pub fn entry_path(&self, provider: &str, coord: TileCoord) -> PathBuf {
        self.provider_dir(provider)
            .join(coord.zoom.to_string())
            .join(coord.x.to_string())
            .join(format!("{}.{}", cache_key(provider, coord), TILE_EXTENSION))
    }

    fn provider_dir(&self, provider: &str) -> PathBuf {
        self.root.join(sanitize_provider(provider))
    }

    /// True when a fresh entry exists. Does not decode it.
    pub fn contains(&self, provider: &str, coord: TileCoord) -> bool {
        let path = self.entry_path(provider, coord);
        matches!(self.age(&path), Some(age) if age <= self.ttl)
    }

    /// Load a tile, or `None` on any kind of miss.
    pub fn get(&self, provider: &str, coord: TileCoord) -> Option<RgbaImage> {
        let path = self.entry_path(provider, coord);
        let age = self.age(&path)?;

        if age > self.ttl {
            debug!("[TileCache] Expired {:?} for {} ({:?} old)", coord, provider, age);
            let _ = fs::remove_file(&path);
            return None;
        }

        let bytes = fs::read(&path).ok()?;
        match image::load_from_memory(&bytes) {
            Ok(img) => Some(img.to_rgba8()),
            Err(e) => {
                warn!(
                    "[TileCache] Corrupt entry {} ({}), removing",
                    path.display(),
                    e
                );
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Store raw tile bytes. Returns whether the entry was written; failures
    /// are logged, never propagated.
    pub fn put(&self, provider: &str, coord: TileCoord, bytes: &[u8]) -> bool {
        let path = self.entry_path(provider, coord);
        match write_atomic(&path, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!("[TileCache] Failed to write {}: {}", path.display(), e);
                false
            }
        }
    }

    fn age(&self, path: &Path) -> Option<Duration> {
        let modified = fs::metadata(path).ok()?.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Totals across every provider.
    pub fn stats(&self) -> CacheStats {
        collect_stats(&self.root)
    }

    /// Totals for one provider.
    pub fn provider_stats(&self, provider: &str) -> CacheStats {
        collect_stats(&self.provider_dir(provider))
    }

    /// Delete every entry. A missing root is not an error.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Delete entries older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let removed = tile_files(&self.root)
            .filter(|entry| matches!(self.age(entry.path()), Some(age) if age > self.ttl))
            .filter(|entry| fs::remove_file(entry.path()).is_ok())
            .count();
        if removed > 0 {
            debug!("[TileCache] Purged {} expired tiles", removed);
        }
        removed
    }
}

/// 128-bit SipHash of the full key, as 32 hex digits.
fn cache_key(provider: &str, coord: TileCoord) -> String {
    let mut hasher = SipHasher13::new();
    hasher.write(provider.as_bytes());
    hasher.write_u8(0);
    hasher.write_u8(coord.zoom);
    hasher.write_u32(coord.x);
    hasher.write_u32(coord.y);
    format!("{:032x}", hasher.finish128().as_u128())
}

/// Lowercase provider name with anything outside `[a-z0-9_-]` mapped to `_`.
fn sanitize_provider(provider: &str) -> String {
    let name: String = provider
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "_".to_string()
    } else {
        name
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "entry path has no parent"))?;
    fs::create_dir_all(dir)?;

    let tmp = path.with_extension(format!(
        "tmp-{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    if let Err(e) = fs::write(&tmp, bytes).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn tile_files(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .map_or(false, |ext| ext == TILE_EXTENSION)
        })
}

fn collect_stats(root: &Path) -> CacheStats {
    tile_files(root).fold(CacheStats::default(), |acc, entry| CacheStats {
        tiles: acc.tiles + 1,
        bytes: acc.bytes + entry.metadata().map(|m| m.len()).unwrap_or(0),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png_bytes(color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(4, 4, Rgba(color));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn backdate(path: &Path, by: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    const PROVIDER: &str = "CartoDB Positron NoLabels";

    #[test]
    fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::new(dir.path());
        let coord = TileCoord::new(12, 655, 1583);

        assert!(cache.get(PROVIDER, coord).is_none());
        assert!(cache.put(PROVIDER, coord, &png_bytes([10, 20, 30, 255])));
        assert!(cache.contains(PROVIDER, coord));

        let tile = cache.get(PROVIDER, coord).unwrap();
        assert_eq!(tile.dimensions(), (4, 4));
        assert_eq!(tile.get_pixel(0, 0), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn test_entry_layout() {
        let cache = TileCache::new("/cache");
        let path = cache.entry_path(PROVIDER, TileCoord::new(3, 4, 5));
        let rel = path.strip_prefix("/cache").unwrap();
        let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().to_string()).collect();
        assert_eq!(parts[0], "cartodb_positron_nolabels");
        assert_eq!(parts[1], "3");
        assert_eq!(parts[2], "4");
        assert_eq!(parts[3].len(), 32 + 4);
        assert!(parts[3].ends_with(".png"));
    }

    #[test]
    fn test_keys_distinguish_provider_and_coord() {
        let a = cache_key("a", TileCoord::new(5, 1, 2));
        assert_ne!(a, cache_key("b", TileCoord::new(5, 1, 2)));
        assert_ne!(a, cache_key("a", TileCoord::new(5, 2, 1)));
        assert_ne!(a, cache_key("a", TileCoord::new(6, 1, 2)));
        assert_eq!(a, cache_key("a", TileCoord::new(5, 1, 2)));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::new(dir.path());
        let coord = TileCoord::new(10, 1, 1);
        cache.put(PROVIDER, coord, &png_bytes([0, 0, 0, 255]));

        backdate(&cache.entry_path(PROVIDER, coord), DEFAULT_TTL + Duration::from_secs(60));
        assert!(!cache.contains(PROVIDER, coord));
        assert!(cache.get(PROVIDER, coord).is_none());
        assert!(!cache.entry_path(PROVIDER, coord).exists());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss_and_removed() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::new(dir.path());
        let coord = TileCoord::new(10, 2, 2);
        cache.put(PROVIDER, coord, b"not an image");

        assert!(cache.contains(PROVIDER, coord));
        assert!(cache.get(PROVIDER, coord).is_none());
        assert!(!cache.entry_path(PROVIDER, coord).exists());
    }

    #[test]
    fn test_put_failure_is_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file where a directory should be").unwrap();
        let cache = TileCache::new(&blocker);
        assert!(!cache.put(PROVIDER, TileCoord::new(1, 0, 0), &png_bytes([1, 1, 1, 255])));
    }

    #[test]
    fn test_stats_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::new(dir.path().join("tiles"));
        assert_eq!(cache.stats(), CacheStats::default());

        cache.put("one", TileCoord::new(4, 1, 1), &png_bytes([1, 2, 3, 255]));
        cache.put("one", TileCoord::new(4, 1, 2), &png_bytes([1, 2, 3, 255]));
        cache.put("two", TileCoord::new(4, 1, 1), &png_bytes([1, 2, 3, 255]));

        let stats = cache.stats();
        assert_eq!(stats.tiles, 3);
        assert!(stats.bytes > 0);
        assert_eq!(cache.provider_stats("one").tiles, 2);
        assert_eq!(cache.provider_stats("three").tiles, 0);

        cache.clear().unwrap();
        assert_eq!(cache.stats().tiles, 0);
        cache.clear().unwrap();
    }

    #[test]
    fn test_purge_expired() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::new(dir.path());
        let old = TileCoord::new(8, 1, 1);
        let fresh = TileCoord::new(8, 1, 2);
        cache.put(PROVIDER, old, &png_bytes([5, 5, 5, 255]));
        cache.put(PROVIDER, fresh, &png_bytes([5, 5, 5, 255]));
        backdate(&cache.entry_path(PROVIDER, old), DEFAULT_TTL * 2);

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.contains(PROVIDER, fresh));
        assert_eq!(cache.stats().tiles, 1);
    }

    #[test]
    fn test_cache_survives_new_instance() {
        let dir = TempDir::new().unwrap();
        let coord = TileCoord::new(9, 100, 200);
        TileCache::new(dir.path()).put(PROVIDER, coord, &png_bytes([9, 9, 9, 255]));
        assert!(TileCache::new(dir.path()).get(PROVIDER, coord).is_some());
    }
}
