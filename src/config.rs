use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DetectorError, Result};

/// What a frame's missing axis group becomes when the window is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Missing group reads as the zero vector
    #[default]
    ZeroPad,
    /// Missing group repeats the most recent earlier reading in the window
    CarryForward,
    /// Windows holding an incomplete frame are not evaluated
    RejectFrame,
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    // ── Sampling / alignment ──
    pub sampling_rate_hz: u32,
    pub align_tolerance_ms: u64,
    pub gap_policy: GapPolicy,

    // ── Detection ──
    pub alert_threshold: f64,

    // ── Escalation ──
    pub countdown_secs: u32,
    pub emergency_number: String,
    pub user_id: String,
    pub report_url: String,
    pub report_timeout_secs: u64,

    // ── Background execution ──
    pub background_tick_ms: u64,
    pub notification_every_ticks: u64,

    // ── Contacts ──
    pub require_contacts: bool,
    pub contacts_path: Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: 20,
            align_tolerance_ms: 25,
            gap_policy: GapPolicy::ZeroPad,
            alert_threshold: 0.5,
            countdown_secs: 10,
            emergency_number: "108".to_string(),
            user_id: "anonymous".to_string(),
            report_url: "http://localhost:5000/api/mobile/report".to_string(),
            report_timeout_secs: 15,
            background_tick_ms: 50,
            notification_every_ticks: 200,
            require_contacts: true,
            contacts_path: None,
        }
    }
}

impl DetectorConfig {
    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: DetectorConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sampling_rate_hz == 0 {
            return Err(DetectorError::Config("sampling_rate_hz must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.alert_threshold) {
            return Err(DetectorError::Config(format!(
                "alert_threshold {} outside [0, 1)",
                self.alert_threshold
            )));
        }
        if self.countdown_secs == 0 {
            return Err(DetectorError::Config("countdown_secs must be positive".to_string()));
        }
        if self.background_tick_ms == 0 {
            return Err(DetectorError::Config("background_tick_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Sensor period requested from the sensor source
    pub fn sample_interval_ms(&self) -> u64 {
        1000 / self.sampling_rate_hz as u64
    }
}
