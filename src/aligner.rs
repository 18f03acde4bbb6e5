use log::debug;

use crate::config::{DetectorConfig, GapPolicy};
use crate::error::{DetectorError, Result};
use crate::types::{Frame, SensorSample};
use crate::window::{SlidingWindow, Window};

/// Merges independent accelerometer and gyroscope events into time buckets.
///
/// A sample joins the oldest frame whose timestamp is within the alignment
/// tolerance; otherwise it opens a new frame seeded with the current speed.
/// Accel and gyro can arrive on separate, unsynchronized callbacks because
/// only their monotonic timestamps are compared.
#[derive(Debug, Clone)]
pub struct SampleAligner {
    window: SlidingWindow,
    tolerance_ms: u64,
    policy: GapPolicy,
    current_speed_kmh: f64,
    merged_samples: u64,
    stale_samples: u64,
}

impl SampleAligner {
    pub fn new(tolerance_ms: u64, policy: GapPolicy) -> Self {
        Self {
            window: SlidingWindow::new(),
            tolerance_ms,
            policy,
            current_speed_kmh: 0.0,
            merged_samples: 0,
            stale_samples: 0,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(config.align_tolerance_ms, config.gap_policy)
    }

    /// Place a sample into the window and return the frame it landed in.
    pub fn ingest(&mut self, sample: &SensorSample) -> Result<&Frame> {
        if self.policy == GapPolicy::RejectFrame {
            let cutoff = sample.timestamp_ms.saturating_sub(self.tolerance_ms);
            let pruned = self.window.prune_incomplete(cutoff);
            if pruned > 0 {
                debug!("[ALIGN] Rejected {} incomplete frame(s) before {}ms", pruned, cutoff);
            }
        }

        let tolerance = self.tolerance_ms;
        let matched = self
            .window
            .iter()
            .position(|f| f.timestamp_ms.abs_diff(sample.timestamp_ms) < tolerance);

        if let Some(index) = matched {
            self.merged_samples += 1;
            let frame = self
                .window
                .get_mut(index)
                .ok_or(DetectorError::SensorFailed("aligned frame vanished".to_string()))?;
            frame.merge(sample);
            return Ok(frame);
        }

        if let Some(newest) = self.window.newest() {
            if sample.timestamp_ms < newest.timestamp_ms {
                self.stale_samples += 1;
                return Err(DetectorError::StaleSample {
                    timestamp_ms: sample.timestamp_ms,
                    newest_ms: newest.timestamp_ms,
                });
            }
        }

        let mut frame = Frame::new(sample.timestamp_ms, self.current_speed_kmh);
        frame.merge(sample);
        self.window.push(frame);
        self.window
            .newest()
            .ok_or(DetectorError::SensorFailed("window empty after push".to_string()))
    }

    /// Speed used to seed frames created from now on
    pub fn set_speed_kmh(&mut self, speed_kmh: f64) {
        self.current_speed_kmh = speed_kmh;
    }

    pub fn speed_kmh(&self) -> f64 {
        self.current_speed_kmh
    }

    pub fn is_full(&self) -> bool {
        self.window.is_full()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Evaluable copy of the current window, if it is full and the gap policy allows it
    pub fn snapshot(&self) -> Option<Window> {
        self.window.snapshot(self.policy)
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    pub fn merged_samples(&self) -> u64 {
        self.merged_samples
    }

    pub fn stale_samples(&self) -> u64 {
        self.stale_samples
    }
}
