use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::alert::DetectorState;
use crate::error::Result;
use crate::escalation::{CallPrompt, EscalationStats};
use crate::scorer::Pattern;
use crate::types::GForceLevel;

/// Point-in-time snapshot of the engine, written as `live_status.json`
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EngineStatus {
    pub timestamp: f64,
    pub state: DetectorState,
    pub uptime_seconds: u64,
    // Pipeline
    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub location_fixes: u64,
    pub dropped_samples: u64,
    pub merged_samples: u64,
    pub stale_samples: u64,
    pub frames_buffered: usize,
    pub evaluations: u64,
    pub skipped_evaluations: u64,
    pub last_score: f64,
    pub last_patterns: Vec<Pattern>,
    // Alerts
    pub alerts_raised: u64,
    pub resolutions: u64,
    pub escalations: u64,
    pub active_alert_id: Option<u64>,
    pub countdown_remaining: Option<u32>,
    pub call_prompt: Option<CallPrompt>,
    // Live G-force
    pub g_force: f64,
    pub max_g_force: f64,
    pub g_force_level: GForceLevel,
    pub gyro_intensity: f64,
    pub max_gyro_intensity: f64,
    // Location
    pub speed_kmh: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub background_active: bool,
    pub reporting: EscalationStats,
}

impl EngineStatus {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
