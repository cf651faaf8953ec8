//! Render one route over a basemap, then an annotated wrap of several.
//!
//! Run with: cargo run --example render_route [activities.json]
//!
//! The optional file holds a JSON array of activities. Without it a few
//! loops around London are used. Tiles are fetched from the public providers
//! and cached in the system temp directory.

use std::env;
use std::fs;
use std::path::PathBuf;

use route_canvas::wrap::generate_wrap_blocking;
use route_canvas::{Activity, RenderConfig, Renderer, SmoothingPreset, TileCache, WrapRequest};

fn sample_activities() -> Vec<Activity> {
    (0..4)
        .map(|i| {
            let offset = i as f64 * 0.004;
            let loop_points: Vec<[f64; 2]> = (0..=40)
                .map(|k| {
                    let angle = k as f64 / 40.0 * std::f64::consts::TAU;
                    [51.5074 + offset + 0.006 * angle.sin(), -0.1278 + 0.010 * angle.cos()]
                })
                .collect();
            Activity {
                activity_type: "Run".into(),
                distance: 4200.0 + 300.0 * i as f64,
                moving_time: 1500.0 + 90.0 * i as f64,
                total_elevation_gain: 25.0,
                kudos_count: 3,
                ..Activity::from_latlngs(&format!("loop-{}", i), &format!("Loop {}", i + 1), &loop_points)
            }
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let activities = match env::args().nth(1) {
        Some(path) => serde_json::from_str::<Vec<Activity>>(&fs::read_to_string(path)?)?,
        None => sample_activities(),
    };
    println!("Loaded {} activities\n", activities.len());

    let renderer = Renderer::new(TileCache::in_temp_dir())?;

    // Single activity
    let first = activities.first().ok_or("no activities")?;
    let config = RenderConfig {
        width_px: 1600,
        smoothing: SmoothingPreset::Strava.into(),
        ..Default::default()
    };
    let image = renderer.render_blocking(&first.points, &config)?;
    image.save("route.png")?;
    println!("1. {} -> route.png ({}x{})", first.name, image.width(), image.height());

    // Wrap of everything
    let request = WrapRequest {
        output_path: PathBuf::from("wrap.png"),
        border: true,
        athlete_name: Some("Demo".into()),
        year: Some(2024),
        ..Default::default()
    };
    let result = generate_wrap_blocking(&renderer, &activities, &request)?;
    println!(
        "2. {} activities -> {} ({}x{})",
        result.activities_count,
        result.output_path.display(),
        result.width,
        result.height
    );
    if let Some(stats) = &result.stats {
        println!("   Distance: {:.1} km", stats.total_distance / 1000.0);
        println!("   Moving time: {:.1} h", stats.total_moving_time / 3600.0);
    }

    let cache = renderer.assembler().cache().stats();
    println!("\nTile cache: {} tiles, {} bytes", cache.tiles, cache.bytes);
    Ok(())
}
