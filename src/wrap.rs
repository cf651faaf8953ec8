//! # Wrap Pipeline
//!
//! Renders many activities into one image: optional location filter,
//! optional cluster selection, aggregate statistics, render, optional
//! bordered statistics panel, optional title overlay, PNG on disk.

use std::path::PathBuf;

use log::info;
use serde::{Deserialize, Serialize};

use crate::annotate::{add_border, draw_stats_panel, BorderConfig, FontSource, Fonts};
use crate::clustering::{filter_by_cluster, filter_by_location, find_clusters, Cluster, ClusterConfig};
use crate::compositor::{block_on, save_png, ActivityTrace, RenderConfig, Renderer};
use crate::stats::{ActivityStats, StatsPanel, Units};
use crate::{Activity, Error, GpsPoint, Result};

/// Location filter radius when none is given, in kilometers.
pub const DEFAULT_LOCATION_RADIUS_KM: f64 = 10.0;

/// Everything that shapes one wrap image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapRequest {
    /// Default: "multi_activity_image.png"
    pub output_path: PathBuf,

    /// Keep only activities starting near this point.
    /// Default: None
    pub location: Option<GpsPoint>,

    /// Default: 10 km when `location` is set
    pub location_radius_km: Option<f64>,

    /// Render only the cluster at this index (largest first).
    /// Default: None
    pub cluster_index: Option<usize>,

    /// Default: 50 km radius, automatic minimum size
    pub cluster: ClusterConfig,

    /// Compute statistics.
    /// Default: true
    pub include_stats: bool,

    /// Add a border around the image.
    /// Default: false
    pub border: bool,

    /// Draw the statistics panel in the border's bottom edge.
    /// Default: true
    pub stats_on_border: bool,

    pub border_style: BorderConfig,

    /// Title parts for the statistics panel.
    pub athlete_name: Option<String>,
    pub year: Option<i32>,
    pub activity_type: Option<String>,

    /// Default: metric
    pub units: Units,

    pub fonts: FontSource,

    /// An overlay in here is drawn after the border, titled with
    /// [`title`](Self::title) when its own title is empty.
    /// Default: render defaults with a 3pt line
    pub render: RenderConfig,
}

impl Default for WrapRequest {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("multi_activity_image.png"),
            location: None,
            location_radius_km: None,
            cluster_index: None,
            cluster: ClusterConfig::with_radius(50.0),
            include_stats: true,
            border: false,
            stats_on_border: true,
            border_style: BorderConfig::default(),
            athlete_name: None,
            year: None,
            activity_type: None,
            units: Units::Metric,
            fonts: FontSource::System,
            render: RenderConfig {
                line_width: 3.0,
                ..Default::default()
            },
        }
    }
}

impl WrapRequest {
    pub fn title(&self) -> String {
        StatsPanel::wrap_title(self.athlete_name.as_deref(), self.year, self.activity_type.as_deref())
    }
}

/// What a wrap produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapResult {
    pub output_path: PathBuf,
    pub stats: Option<ActivityStats>,
    /// Activities drawn
    pub activities_count: usize,
    pub activity_ids: Vec<String>,
    /// Cluster the activities were restricted to
    pub cluster: Option<Cluster>,
    pub width: u32,
    pub height: u32,
}

/// Render a wrap image for `activities` and write it to
/// `request.output_path`.
pub async fn generate_wrap(renderer: &Renderer, activities: &[Activity], request: &WrapRequest) -> Result<WrapResult> {
    if activities.is_empty() {
        return Err(Error::NoActivities);
    }

    let mut selected: Vec<Activity> = activities.iter().filter(|a| !a.points.is_empty()).cloned().collect();
    if selected.is_empty() {
        return Err(Error::EmptyTrace);
    }
    let mut filtered = false;

    if let Some(center) = &request.location {
        let radius = request.location_radius_km.unwrap_or(DEFAULT_LOCATION_RADIUS_KM);
        selected = filter_by_location(&selected, center, radius);
        filtered = true;
        if selected.is_empty() {
            return Err(Error::NoActivities);
        }
    }

    let mut chosen_cluster = None;
    if let Some(index) = request.cluster_index {
        let clusters = find_clusters(&selected, &request.cluster);
        let cluster = clusters.get(index).cloned().ok_or(Error::ClusterIndexOutOfRange {
            index,
            count: clusters.len(),
        })?;
        selected = filter_by_cluster(&selected, &cluster);
        chosen_cluster = Some(cluster);
        filtered = true;
    }

    // Without filters, statistics also count activities that have no GPS data.
    let stats = if request.include_stats {
        let source = if filtered { selected.as_slice() } else { activities };
        ActivityStats::from_activities(source)
    } else {
        None
    };

    info!(
        "[Wrap] Rendering {} of {} activities to {}",
        selected.len(),
        activities.len(),
        request.output_path.display()
    );
    let traces: Vec<ActivityTrace> = selected.iter().map(ActivityTrace::from).collect();
    let mut image = renderer.render_many_map(&traces, &request.render).await?;

    if request.border {
        let (bordered, insets) = add_border(&image, &request.border_style)?;
        image = bordered;
        if let (true, Some(stats)) = (request.stats_on_border, &stats) {
            let fonts = Fonts::load(&request.fonts)?;
            let panel = StatsPanel::from_stats(stats, &request.title(), request.units);
            draw_stats_panel(&mut image, &insets, &panel, &fonts);
        }
    }

    if let Some(overlay) = &request.render.overlay {
        let mut overlay = overlay.clone();
        if overlay.title.is_empty() {
            overlay.title = request.title();
        }
        renderer.draw_overlay(&mut image, &overlay).await?;
    }

    save_png(&image, &request.output_path)?;

    Ok(WrapResult {
        output_path: request.output_path.clone(),
        stats,
        activities_count: selected.len(),
        activity_ids: selected.iter().map(|a| a.id.clone()).collect(),
        cluster: chosen_cluster,
        width: image.width(),
        height: image.height(),
    })
}

/// [`generate_wrap`] on a private runtime. Must not be called from inside an
/// async context.
pub fn generate_wrap_blocking(renderer: &Renderer, activities: &[Activity], request: &WrapRequest) -> Result<WrapResult> {
    block_on(generate_wrap(renderer, activities, request))?
}
