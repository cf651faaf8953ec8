//! Group activities into areas of interest by their start points.
//!
//! Run with: cargo run --example find_areas [activities.json] [radius_km]

use std::env;
use std::fs;

use route_canvas::clustering::largest_cluster;
use route_canvas::{find_clusters, Activity, ClusterConfig};

fn synthetic_history() -> Vec<Activity> {
    let homes = [("Bern", 46.948, 7.447, 14), ("Thun", 46.758, 7.628, 9), ("Basel", 47.559, 7.588, 4)];
    let mut activities = Vec::new();
    for (town, lat, lng, count) in homes {
        for i in 0..count {
            let jitter = (i as f64 * 0.37).sin() * 0.01;
            let start = [lat + jitter, lng - jitter];
            let end = [lat + jitter + 0.02, lng + 0.01];
            activities.push(Activity::from_latlngs(
                &format!("{}-{}", town.to_lowercase(), i),
                &format!("{} ride {}", town, i + 1),
                &[start, end],
            ));
        }
    }
    activities
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let activities = match args.next() {
        Some(path) => serde_json::from_str::<Vec<Activity>>(&fs::read_to_string(path)?)?,
        None => synthetic_history(),
    };
    let radius_km = match args.next() {
        Some(r) => r.parse::<f64>()?,
        None => 5.0,
    };

    let config = ClusterConfig {
        radius_km,
        min_activities: Some(2),
        ..Default::default()
    };
    let clusters = find_clusters(&activities, &config);

    println!("Areas of interest ({} activities, {} km radius)\n", activities.len(), radius_km);
    for (index, cluster) in clusters.iter().enumerate() {
        println!(
            "{}. {} activities around ({:.4}, {:.4})",
            index,
            cluster.count(),
            cluster.center.latitude,
            cluster.center.longitude
        );
        for id in cluster.activity_ids.iter().take(3) {
            println!("   - {}", id);
        }
        if cluster.count() > 3 {
            println!("   ... and {} more", cluster.count() - 3);
        }
    }

    if let Some(largest) = largest_cluster(&activities, radius_km) {
        println!("\nRender the largest area with cluster_index 0 ({} activities)", largest.count());
    }
    Ok(())
}
