//! Activity statistics and the strings shown in the statistics panel.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Activity;

const METERS_PER_MILE: f64 = 1609.344;
const FEET_PER_METER: f64 = 3.280_84;

/// Sports whose speed is shown as a pace rather than a speed.
const FOOT_SPORTS: [&str; 4] = ["Run", "Walk", "Hike", "TrailRun"];

/// Distance units for displayed figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Units {
    #[default]
    Metric,
    Imperial,
}

impl Units {
    pub fn distance_unit(&self) -> &'static str {
        match self {
            Units::Metric => "km",
            Units::Imperial => "mi",
        }
    }

    pub fn elevation_unit(&self) -> &'static str {
        match self {
            Units::Metric => "m",
            Units::Imperial => "ft",
        }
    }

    /// Meters in this system's distance unit.
    pub fn distance(&self, meters: f64) -> f64 {
        match self {
            Units::Metric => meters / 1000.0,
            Units::Imperial => meters / METERS_PER_MILE,
        }
    }

    /// Meters in this system's elevation unit.
    pub fn elevation(&self, meters: f64) -> f64 {
        match self {
            Units::Metric => meters,
            Units::Imperial => meters * FEET_PER_METER,
        }
    }
}

impl FromStr for Units {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "km" | "metric" => Ok(Units::Metric),
            "mi" | "miles" | "imperial" => Ok(Units::Imperial),
            other => Err(format!("unknown units: {}", other)),
        }
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// Totals for one sport type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeTotals {
    pub count: usize,
    /// Meters
    pub distance: f64,
    /// Seconds
    pub moving_time: f64,
}

/// Aggregate statistics over a set of activities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityStats {
    pub count: usize,
    /// Meters
    pub total_distance: f64,
    /// Meters
    pub total_elevation_gain: f64,
    /// Seconds
    pub total_moving_time: f64,
    pub total_kudos: u64,
    pub by_type: BTreeMap<String, TypeTotals>,
}

impl ActivityStats {
    /// Aggregate `activities`. `None` when there are none.
    pub fn from_activities(activities: &[Activity]) -> Option<Self> {
        if activities.is_empty() {
            return None;
        }

        let mut stats = ActivityStats {
            count: activities.len(),
            ..Default::default()
        };
        for activity in activities {
            stats.total_distance += activity.distance;
            stats.total_elevation_gain += activity.total_elevation_gain;
            stats.total_moving_time += activity.moving_time;
            stats.total_kudos += u64::from(activity.kudos_count);

            let kind = if activity.activity_type.is_empty() {
                "Unknown"
            } else {
                activity.activity_type.as_str()
            };
            let bucket = stats.by_type.entry(kind.to_string()).or_default();
            bucket.count += 1;
            bucket.distance += activity.distance;
            bucket.moving_time += activity.moving_time;
        }
        Some(stats)
    }

    /// The sport with the most activities; ties go to the alphabetically first.
    pub fn primary_type(&self) -> Option<(&str, &TypeTotals)> {
        self.by_type
            .iter()
            .max_by(|a, b| a.1.count.cmp(&b.1.count).then_with(|| b.0.cmp(a.0)))
            .map(|(kind, totals)| (kind.as_str(), totals))
    }

    /// Pace or speed of the primary sport.
    pub fn pace(&self, units: Units) -> (String, String) {
        match self.primary_type() {
            Some((kind, totals)) => pace_parts(totals.distance, totals.moving_time, kind, units),
            None => ("N/A".to_string(), String::new()),
        }
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// Pace (`5:30`, `min/km`) for foot sports, speed (`25.3`, `km/h`) otherwise.
/// Zero distance or time gives `N/A` with no unit.
pub fn pace_parts(distance_m: f64, time_s: f64, activity_type: &str, units: Units) -> (String, String) {
    if distance_m <= 0.0 || time_s <= 0.0 {
        return ("N/A".to_string(), String::new());
    }
    let distance = units.distance(distance_m);

    if FOOT_SPORTS.contains(&activity_type) {
        let minutes_per_unit = (time_s / 60.0) / distance;
        let mins = minutes_per_unit.trunc();
        let secs = ((minutes_per_unit - mins) * 60.0).trunc();
        (
            format!("{}:{:02}", mins as u64, secs as u64),
            format!("min/{}", units.distance_unit()),
        )
    } else {
        let speed = distance / (time_s / 3600.0);
        let unit = match units {
            Units::Metric => "km/h",
            Units::Imperial => "mph",
        };
        (format!("{:.1}", speed), unit.to_string())
    }
}

/// [`pace_parts`] joined with a space.
pub fn format_pace(distance_m: f64, time_s: f64, activity_type: &str, units: Units) -> String {
    match pace_parts(distance_m, time_s, activity_type, units) {
        (value, unit) if unit.is_empty() => value,
        (value, unit) => format!("{} {}", value, unit),
    }
}

/// `1h 2m 3s`, `2m 3s` or `3s`.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Capitalise the first letter of every word and lowercase the rest, keeping
/// possessive `'s` lowercase.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_cased = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if prev_cased {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_cased = true;
        } else {
            out.push(c);
            prev_cased = false;
        }
    }
    out.replace("'S ", "'s ").replace("'S", "'s")
}

// ============================================================================
// Statistics Panel
// ============================================================================

/// One figure in the statistics panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatCell {
    pub number: String,
    /// Drawn smaller, right after the number
    pub unit: String,
    pub label: String,
}

impl StatCell {
    fn new(number: impl Into<String>, unit: &str, label: &str) -> Self {
        Self {
            number: number.into(),
            unit: unit.to_string(),
            label: label.to_string(),
        }
    }
}

/// Title and two rows of three figures for the bottom border.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsPanel {
    pub title: String,
    pub rows: [[StatCell; 3]; 2],
}

impl StatsPanel {
    /// Activities, kudos and distance on the first row; time, elevation and
    /// pace on the second.
    pub fn from_stats(stats: &ActivityStats, title: &str, units: Units) -> Self {
        let (pace, pace_unit) = stats.pace(units);
        let distance = units.distance(stats.total_distance).trunc() as u64;
        let hours = stats.total_moving_time / 3600.0;
        let elevation = units.elevation(stats.total_elevation_gain);

        Self {
            title: title_case(title),
            rows: [
                [
                    StatCell::new(stats.count.to_string(), "", "Activities"),
                    StatCell::new(stats.total_kudos.to_string(), "", "Kudos"),
                    StatCell::new(distance.to_string(), units.distance_unit(), "Distance"),
                ],
                [
                    StatCell::new(format!("{:.0}", hours), "hrs", "Time"),
                    StatCell::new(format!("{:.0}", elevation), units.elevation_unit(), "Elevation"),
                    StatCell::new(pace, &pace_unit, "Pace"),
                ],
            ],
        }
    }

    /// `"<name>'s <year> <type> Wrap"` with the parts that are known.
    pub fn wrap_title(name: Option<&str>, year: Option<i32>, activity_type: Option<&str>) -> String {
        let owner = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => format!("{}'s", name),
            None => "My".to_string(),
        };
        match (year, activity_type) {
            (Some(year), Some(kind)) => format!("{} {} {} Wrap", owner, year, kind),
            (Some(year), None) => format!("{} {} Activity Wrap", owner, year),
            (None, Some(kind)) => format!("{} {} Wrap", owner, kind),
            (None, None) => format!("{} Activity Wrap", owner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(kind: &str, distance: f64, time: f64, elevation: f64, kudos: u32) -> Activity {
        Activity {
            id: format!("{}-{}", kind, distance),
            activity_type: kind.to_string(),
            distance,
            moving_time: time,
            total_elevation_gain: elevation,
            kudos_count: kudos,
            ..Default::default()
        }
    }

    #[test]
    fn test_from_activities_totals() {
        let stats = ActivityStats::from_activities(&[
            activity("Run", 10_000.0, 3000.0, 100.0, 3),
            activity("Run", 5_000.0, 1500.0, 50.0, 2),
            activity("Ride", 40_000.0, 5400.0, 400.0, 7),
            activity("", 1_000.0, 600.0, 0.0, 0),
        ])
        .unwrap();

        assert_eq!(stats.count, 4);
        assert_eq!(stats.total_distance, 56_000.0);
        assert_eq!(stats.total_elevation_gain, 550.0);
        assert_eq!(stats.total_moving_time, 10_500.0);
        assert_eq!(stats.total_kudos, 12);
        assert_eq!(stats.by_type["Run"].count, 2);
        assert_eq!(stats.by_type["Unknown"].count, 1);
        assert_eq!(stats.primary_type().unwrap().0, "Run");
    }

    #[test]
    fn test_from_activities_empty() {
        assert!(ActivityStats::from_activities(&[]).is_none());
    }

    #[test]
    fn test_primary_type_tie_breaks_alphabetically() {
        let stats = ActivityStats::from_activities(&[
            activity("Swim", 1.0, 1.0, 0.0, 0),
            activity("Hike", 1.0, 1.0, 0.0, 0),
        ])
        .unwrap();
        assert_eq!(stats.primary_type().unwrap().0, "Hike");
    }

    #[test]
    fn test_format_pace() {
        assert_eq!(format_pace(10_000.0, 3300.0, "Run", Units::Metric), "5:30 min/km");
        assert_eq!(format_pace(40_000.0, 5400.0, "Ride", Units::Metric), "26.7 km/h");
        assert_eq!(format_pace(0.0, 100.0, "Run", Units::Metric), "N/A");
        assert_eq!(format_pace(100.0, 0.0, "Ride", Units::Metric), "N/A");
        assert_eq!(format_pace(METERS_PER_MILE * 2.0, 1200.0, "Walk", Units::Imperial), "10:00 min/mi");
        assert_eq!(format_pace(METERS_PER_MILE * 10.0, 3600.0, "Ride", Units::Imperial), "10.0 mph");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(3723.0), "1h 2m 3s");
        assert_eq!(format_duration(123.0), "2m 3s");
        assert_eq!(format_duration(7.9), "7s");
        assert_eq!(format_duration(-5.0), "0s");
    }

    #[test]
    fn test_title_case_keeps_possessive() {
        assert_eq!(title_case("john's 2024 run wrap"), "John's 2024 Run Wrap");
        assert_eq!(title_case("ANNA'S WRAP"), "Anna's Wrap");
        assert_eq!(title_case("trail-run"), "Trail-Run");
    }

    #[test]
    fn test_stats_panel_cells() {
        let stats = ActivityStats::from_activities(&[
            activity("Run", 10_500.0, 3300.0, 120.4, 4),
            activity("Run", 10_500.0, 3300.0, 80.0, 1),
        ])
        .unwrap();
        let panel = StatsPanel::from_stats(&stats, "sam's 2024 run wrap", Units::Metric);

        assert_eq!(panel.title, "Sam's 2024 Run Wrap");
        assert_eq!(panel.rows[0][0], StatCell::new("2", "", "Activities"));
        assert_eq!(panel.rows[0][1], StatCell::new("5", "", "Kudos"));
        assert_eq!(panel.rows[0][2], StatCell::new("21", "km", "Distance"));
        assert_eq!(panel.rows[1][0], StatCell::new("2", "hrs", "Time"));
        assert_eq!(panel.rows[1][1], StatCell::new("200", "m", "Elevation"));
        assert_eq!(panel.rows[1][2], StatCell::new("5:14", "min/km", "Pace"));
    }

    #[test]
    fn test_wrap_title() {
        assert_eq!(StatsPanel::wrap_title(Some("Jo"), Some(2024), Some("Run")), "Jo's 2024 Run Wrap");
        assert_eq!(StatsPanel::wrap_title(None, Some(2024), None), "My 2024 Activity Wrap");
        assert_eq!(StatsPanel::wrap_title(Some(" "), None, Some("Ride")), "My Ride Wrap");
    }

    #[test]
    fn test_units_parse() {
        assert_eq!("miles".parse::<Units>().unwrap(), Units::Imperial);
        assert_eq!("KM".parse::<Units>().unwrap(), Units::Metric);
        assert!("furlongs".parse::<Units>().is_err());
    }
}
