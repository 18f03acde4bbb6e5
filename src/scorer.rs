use serde::{Deserialize, Serialize};

use crate::features::Metrics;
use crate::window::Window;

// Thresholds (hand-tuned, G / deg/s / km/h)
const CRASH_ACCEL_G: f64 = 25.0;
const CRASH_GYRO_DPS: f64 = 400.0;
const CRASH_SPEED_DROP_KMH: f64 = 15.0;
const BRAKE_Y_G: f64 = 1.5;
const BRAKE_MIN_SAMPLES: usize = 30;
const DROP_ACCEL_G: f64 = 15.0;
const DROP_GYRO_VARIANCE: f64 = 50_000.0;
const POTHOLE_Z_G: f64 = 3.0;
const STILLNESS_MIN: f64 = 0.8;
const STILLNESS_MIN_PRIOR_SCORE: f64 = 0.3;

/// Heuristic rules, listed in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    SevereCrash,
    HardBrake,
    PhoneDrop,
    Pothole,
    PostImpactStillness,
}

impl Pattern {
    pub fn delta(&self) -> f64 {
        match self {
            Pattern::SevereCrash => 0.7,
            Pattern::HardBrake => 0.2,
            Pattern::PhoneDrop => -0.3,
            Pattern::Pothole => -0.2,
            Pattern::PostImpactStillness => 0.2,
        }
    }
}

/// Outcome of scoring one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub score: f64,
    pub fired: Vec<Pattern>,
    pub metrics: Metrics,
}

impl Assessment {
    pub fn exceeds(&self, threshold: f64) -> bool {
        self.score > threshold
    }
}

/// Deterministic crash scorer.
///
/// Rules run in a fixed order: the suppression rules correct whatever the
/// earlier rules added, and post-impact stillness only confirms a score that
/// has already survived suppression.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternScorer;

impl PatternScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score in [0, 1]
    pub fn score(&self, m: &Metrics) -> f64 {
        self.evaluate(m).0
    }

    /// Extract metrics from a full window and score them
    pub fn assess(&self, window: &Window) -> Assessment {
        let metrics = Metrics::extract(window);
        let (score, fired) = self.evaluate(&metrics);
        Assessment { score, fired, metrics }
    }

    fn evaluate(&self, m: &Metrics) -> (f64, Vec<Pattern>) {
        let mut score = 0.0_f64;
        let mut fired = Vec::new();

        if m.max_accel_spike > CRASH_ACCEL_G
            && m.max_gyro > CRASH_GYRO_DPS
            && m.speed_drop > CRASH_SPEED_DROP_KMH
        {
            score += Pattern::SevereCrash.delta();
            fired.push(Pattern::SevereCrash);
        }

        if m.y_axis_sustained > BRAKE_Y_G && m.sustained_duration > BRAKE_MIN_SAMPLES {
            score += Pattern::HardBrake.delta();
            fired.push(Pattern::HardBrake);
        }

        // Tumble without a crash: impact plus chaotic rotation
        if m.max_accel_spike > DROP_ACCEL_G && m.gyro_variance > DROP_GYRO_VARIANCE {
            score = (score + Pattern::PhoneDrop.delta()).max(0.0);
            fired.push(Pattern::PhoneDrop);
        }

        if m.z_axis_spike > POTHOLE_Z_G && m.quick_recovery {
            score = (score + Pattern::Pothole.delta()).max(0.0);
            fired.push(Pattern::Pothole);
        }

        if m.final_stillness > STILLNESS_MIN && score > STILLNESS_MIN_PRIOR_SCORE {
            score += Pattern::PostImpactStillness.delta();
            fired.push(Pattern::PostImpactStillness);
        }

        (score.clamp(0.0, 1.0), fired)
    }
}
