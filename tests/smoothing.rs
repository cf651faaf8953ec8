//! Smoothing through the public entry points.

use route_canvas::{smooth, GpsPoint, Smoothing, SmoothingPreset, SmoothingSpec};

fn zigzag(n: usize) -> Vec<GpsPoint> {
    (0..n)
        .map(|i| {
            let wobble = if i % 2 == 0 { 0.0005 } else { -0.0005 };
            GpsPoint::new(45.0 + i as f64 * 0.001 + wobble, 7.0 + i as f64 * 0.001)
        })
        .collect()
}

#[test]
fn test_moving_average_five_points() {
    let trace: Vec<GpsPoint> = [1.0, 2.0, 3.0, 4.0, 5.0]
        .iter()
        .map(|v| GpsPoint::new(*v, *v * 10.0))
        .collect();
    let out = smooth(&trace, &Smoothing::MovingAverage { window_size: 3 });

    let lats: Vec<f64> = out.iter().map(|p| p.latitude).collect();
    let expected = [1.5, 2.0, 3.0, 4.0, 4.5];
    for (got, want) in lats.iter().zip(expected) {
        assert!((got - want).abs() < 1e-12, "{:?}", lats);
    }
    assert!((out[0].longitude - 15.0).abs() < 1e-12);
}

#[test]
fn test_interpolating_spline_hits_samples() {
    let trace = zigzag(12);
    let out = smooth(&trace, &SmoothingPreset::Strava.resolve());

    assert_eq!(out.len(), trace.len());
    for (got, want) in out.iter().zip(&trace) {
        assert!((got.latitude - want.latitude).abs() < 1e-9);
        assert!((got.longitude - want.longitude).abs() < 1e-9);
    }
}

#[test]
fn test_spline_resamples() {
    let trace = zigzag(10);
    let out = smooth(&trace, &Smoothing::Spline { smoothing_factor: 0.0, num_points: Some(37) });

    assert_eq!(out.len(), 37);
    assert!((out[0].latitude - trace[0].latitude).abs() < 1e-9);
    assert!((out[36].longitude - trace[9].longitude).abs() < 1e-9);
}

#[test]
fn test_heavier_presets_smooth_more() {
    let trace = zigzag(60);
    let roughness = |points: &[GpsPoint]| -> f64 {
        points
            .windows(3)
            .map(|w| (w[0].latitude - 2.0 * w[1].latitude + w[2].latitude).abs())
            .sum()
    };

    let light = smooth(&trace, &SmoothingPreset::Light.resolve());
    let heavy = smooth(&trace, &SmoothingPreset::Heavy.resolve());
    assert!(roughness(&light) < roughness(&trace));
    assert!(roughness(&heavy) < roughness(&light));
}

#[test]
fn test_short_traces_pass_through() {
    let trace = zigzag(2);
    for preset in SmoothingPreset::ALL {
        assert_eq!(smooth(&trace, &preset.resolve()), trace, "{}", preset);
    }
}

#[test]
fn test_spec_from_json() {
    let spec: SmoothingSpec = serde_json::from_str(r#""light""#).unwrap();
    assert_eq!(spec.resolve(), Smoothing::Gaussian { sigma: 0.8 });
    assert!("wobbly".parse::<SmoothingPreset>().is_err());
}
