//! Crash-relevant aggregate metrics over one full detection window.
//!
//! All slice bounds below are fixed sample indices into a 150-frame window
//! sampled at 20 Hz.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::window::{Window, WINDOW_CAPACITY};

/// One Earth gravity in the gravity-normalized sensor units
pub const ONE_G: f64 = 1.0;

/// Mid-window slice that carries a braking signature
const BRAKE_SLICE: Range<usize> = 10..80;
/// Per-sample |accel y| above which a sample counts toward sustained braking
const BRAKE_SAMPLE_G: f64 = 1.0;
/// Boundary between the "impact" and "aftermath" halves
const HALF: usize = WINDOW_CAPACITY / 2;
/// Trailing samples inspected for post-impact stillness
const STILLNESS_TAIL: usize = 20;

/// Immutable per-window feature snapshot
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// Peak acceleration magnitude, G
    pub max_accel_spike: f64,
    /// Peak rotation rate magnitude, deg/s
    pub max_gyro: f64,
    /// Mean |accel y| over the brake slice, G
    pub y_axis_sustained: f64,
    /// Samples in the brake slice with |accel y| above 1 G
    pub sustained_duration: usize,
    /// First minus last frame speed, km/h
    pub speed_drop: f64,
    /// Population variance of the gyro magnitude
    pub gyro_variance: f64,
    /// Peak |accel z|, G
    pub z_axis_spike: f64,
    /// First-half accel peak is more than double the second-half peak
    pub quick_recovery: bool,
    /// 1.0 when the last 20 samples sit exactly at resting gravity
    pub final_stillness: f64,
}

impl Metrics {
    /// Extract metrics from a full window. Pure and total.
    pub fn extract(window: &Window) -> Self {
        let frames = window.frames();

        let accel_mag: Vec<f64> = frames.iter().map(|f| f.accel.norm()).collect();
        let gyro_mag: Vec<f64> = frames.iter().map(|f| f.gyro.norm()).collect();

        let brake = &frames[BRAKE_SLICE];
        let y_axis_sustained =
            brake.iter().map(|f| f.accel.y.abs()).sum::<f64>() / brake.len() as f64;
        let sustained_duration = brake
            .iter()
            .filter(|f| f.accel.y.abs() > BRAKE_SAMPLE_G)
            .count();

        let speed_drop = window.first().speed_kmh - window.last().speed_kmh;

        let first_half_max = max_of(&accel_mag[..HALF]);
        let second_half_max = max_of(&accel_mag[HALF..]);

        let tail = &accel_mag[WINDOW_CAPACITY - STILLNESS_TAIL..];
        let tail_deviation =
            tail.iter().map(|m| (m - ONE_G).abs()).sum::<f64>() / STILLNESS_TAIL as f64;

        Self {
            max_accel_spike: max_of(&accel_mag),
            max_gyro: max_of(&gyro_mag),
            y_axis_sustained,
            sustained_duration,
            speed_drop,
            gyro_variance: population_variance(&gyro_mag),
            z_axis_spike: frames.iter().map(|f| f.accel.z.abs()).fold(0.0, f64::max),
            quick_recovery: first_half_max > 2.0 * second_half_max,
            final_stillness: 1.0 - tail_deviation / ONE_G,
        }
    }
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FusedFrame;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    fn resting_window() -> Vec<FusedFrame> {
        (0..WINDOW_CAPACITY as u64)
            .map(|i| FusedFrame::new(i * 50, Vector3::new(0.0, 0.0, 1.0), Vector3::zeros(), 40.0))
            .collect()
    }

    #[test]
    fn test_resting_window() {
        let window = Window::try_from(resting_window()).unwrap();
        let m = Metrics::extract(&window);

        assert_abs_diff_eq!(m.max_accel_spike, 1.0);
        assert_abs_diff_eq!(m.max_gyro, 0.0);
        assert_abs_diff_eq!(m.y_axis_sustained, 0.0);
        assert_eq!(m.sustained_duration, 0);
        assert_abs_diff_eq!(m.speed_drop, 0.0);
        assert_abs_diff_eq!(m.gyro_variance, 0.0);
        assert_abs_diff_eq!(m.z_axis_spike, 1.0);
        assert!(!m.quick_recovery);
        assert_abs_diff_eq!(m.final_stillness, 1.0);
    }

    #[test]
    fn test_brake_slice_bounds() {
        let mut frames = resting_window();
        // Only indices 10..80 count; 9 and 80 must be ignored
        for (i, frame) in frames.iter_mut().enumerate() {
            if (9..=80).contains(&i) {
                frame.accel.y = 2.0;
            }
        }
        let m = Metrics::extract(&Window::try_from(frames).unwrap());
        assert_eq!(m.sustained_duration, 70);
        assert_abs_diff_eq!(m.y_axis_sustained, 2.0);
    }

    #[test]
    fn test_speed_drop_and_variance() {
        let mut frames = resting_window();
        frames[149].speed_kmh = 10.0;
        for frame in frames.iter_mut().take(75) {
            frame.gyro = Vector3::new(0.0, 0.0, 100.0);
        }
        let m = Metrics::extract(&Window::try_from(frames).unwrap());

        assert_abs_diff_eq!(m.speed_drop, 30.0);
        assert_abs_diff_eq!(m.max_gyro, 100.0);
        // Half at 100, half at 0
        assert_abs_diff_eq!(m.gyro_variance, 2500.0, epsilon = 1e-9);
    }

    #[test]
    fn test_quick_recovery_and_stillness() {
        let mut frames = resting_window();
        frames[20].accel = Vector3::new(0.0, 0.0, 4.0);
        for frame in frames.iter_mut().skip(130) {
            frame.accel = Vector3::new(0.0, 0.0, 1.5);
        }
        let m = Metrics::extract(&Window::try_from(frames).unwrap());

        assert!(m.quick_recovery);
        assert_abs_diff_eq!(m.z_axis_spike, 4.0);
        assert_abs_diff_eq!(m.final_stillness, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_padded_tail_is_not_still() {
        let mut frames = resting_window();
        for frame in frames.iter_mut().skip(130) {
            frame.accel = Vector3::zeros();
        }
        let m = Metrics::extract(&Window::try_from(frames).unwrap());
        assert_abs_diff_eq!(m.final_stillness, 0.0);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let mut frames = resting_window();
        frames[60].accel = Vector3::new(12.0, -3.0, 2.0);
        frames[61].gyro = Vector3::new(200.0, 50.0, -10.0);
        let window = Window::try_from(frames).unwrap();
        assert_eq!(Metrics::extract(&window), Metrics::extract(&window));
    }
}
