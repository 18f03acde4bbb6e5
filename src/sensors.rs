//! Sensor and location source for the live binary.
//!
//! Samples come from `termux-sensor` when running on a device and from a
//! scripted drive otherwise. The script cruises and, if asked, plays one
//! synthetic scenario at a fixed offset so the whole alert path can be
//! exercised from a desktop.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::collaborators::{LocationSource, SensorSource};
use crate::error::{recover, DetectorError, Result};
use crate::synthetic::Scenario;
use crate::types::{FusedFrame, LocationFix, SensorKind, SensorSample};
use crate::window::WINDOW_CAPACITY;

/// Standard gravity, m/s²
const STANDARD_GRAVITY: f64 = 9.80665;
const FRAME_MS: u64 = 50;
const LOCATION_PERIOD: Duration = Duration::from_secs(1);
const BASE_LAT: f64 = 12.9716;
const BASE_LON: f64 = 77.5946;

/// Cruise forever, optionally switching to `scenario` at `inject_at_ms`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveScript {
    pub scenario: Option<Scenario>,
    pub inject_at_ms: u64,
}

impl DriveScript {
    pub fn cruise() -> Self {
        Self { scenario: None, inject_at_ms: 0 }
    }

    pub fn with_scenario(scenario: Scenario, inject_at_ms: u64) -> Self {
        Self { scenario: Some(scenario), inject_at_ms }
    }

    /// Scripted frame at `elapsed_ms` since the source started
    pub fn frame_at(&self, elapsed_ms: u64) -> FusedFrame {
        let index = (elapsed_ms / FRAME_MS) as usize;
        let frame = match self.scenario {
            Some(scenario) if elapsed_ms >= self.inject_at_ms => {
                scenario.frame(((elapsed_ms - self.inject_at_ms) / FRAME_MS) as usize)
            }
            _ => Scenario::Cruise.frame(index % WINDOW_CAPACITY),
        };
        FusedFrame { timestamp_ms: elapsed_ms, ..frame }
    }
}

#[derive(Default)]
struct SimState {
    rates: HashMap<SensorKind, u32>,
    streams: HashMap<SensorKind, JoinHandle<()>>,
    location: Option<JoinHandle<()>>,
}

struct Shared {
    script: DriveScript,
    use_device: bool,
    origin: Instant,
    state: Mutex<SimState>,
}

impl Shared {
    fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sample(&self, kind: SensorKind) -> SensorSample {
        let now = self.elapsed_ms();
        if self.use_device {
            if let Some(sample) = read_device(kind, now) {
                return sample;
            }
        }
        let frame = self.script.frame_at(now);
        let v = match kind {
            SensorKind::Accel => frame.accel,
            SensorKind::Gyro => frame.gyro,
        };
        SensorSample { timestamp_ms: now, kind, x: v.x, y: v.y, z: v.z }
    }

    fn fix(&self) -> LocationFix {
        let now = self.elapsed_ms();
        let frame = self.script.frame_at(now);
        LocationFix {
            latitude: BASE_LAT + now as f64 * 1e-7,
            longitude: BASE_LON,
            speed_mps: Some(frame.speed_kmh / 3.6),
            timestamp_ms: now,
        }
    }
}

/// Tokio-driven sensor and location source
#[derive(Clone)]
pub struct SimulatedSensors {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl SimulatedSensors {
    pub fn new(script: DriveScript) -> Result<Self> {
        Self::build(script, false)
    }

    /// Prefer `termux-sensor` readings, falling back to the script per sample
    pub fn with_device(script: DriveScript) -> Result<Self> {
        Self::build(script, true)
    }

    fn build(script: DriveScript, use_device: bool) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| DetectorError::NoRuntime(e.to_string()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                script,
                use_device,
                origin: Instant::now(),
                state: Mutex::new(SimState::default()),
            }),
            runtime,
        })
    }
}

impl SensorSource for SimulatedSensors {
    fn set_rate(&self, kind: SensorKind, hz: u32) -> Result<()> {
        if hz == 0 {
            return Err(DetectorError::SensorFailed(format!("{:?} rate must be positive", kind)));
        }
        recover(self.shared.state.lock()).rates.insert(kind, hz);
        Ok(())
    }

    fn subscribe(&self, kind: SensorKind, tx: Sender<SensorSample>) -> Result<()> {
        let mut state = recover(self.shared.state.lock());
        let hz = state.rates.get(&kind).copied().unwrap_or(20);
        let period = Duration::from_millis(1000 / hz as u64);
        let shared = self.shared.clone();

        let task = self.runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sample_count = 0u64;

            loop {
                ticker.tick().await;
                match tx.try_send(shared.sample(kind)) {
                    Ok(_) => {
                        sample_count += 1;
                        if sample_count % 1000 == 0 {
                            debug!("[SENSOR] {:?}: {} samples", kind, sample_count);
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("[SENSOR] {:?} channel closed after {} samples", kind, sample_count);
                        break;
                    }
                    Err(TrySendError::Full(_)) => {
                        // Consumer is behind, drop this sample
                    }
                }
            }
        });

        if let Some(previous) = state.streams.insert(kind, task) {
            previous.abort();
        }
        info!("[SENSOR] {:?} subscribed at {} Hz", kind, hz);
        Ok(())
    }

    fn unsubscribe(&self, kind: SensorKind) {
        if let Some(task) = recover(self.shared.state.lock()).streams.remove(&kind) {
            task.abort();
            info!("[SENSOR] {:?} unsubscribed", kind);
        }
    }

    fn poll(&self) -> Vec<SensorSample> {
        // Streams that are still subscribed deliver on their own
        let state = recover(self.shared.state.lock());
        [SensorKind::Accel, SensorKind::Gyro]
            .into_iter()
            .filter(|kind| !state.streams.contains_key(kind))
            .map(|kind| self.shared.sample(kind))
            .collect()
    }
}

impl LocationSource for SimulatedSensors {
    fn subscribe(&self, tx: Sender<LocationFix>) -> Result<()> {
        let shared = self.shared.clone();
        let task = self.runtime.spawn(async move {
            let mut ticker = interval(LOCATION_PERIOD);
            loop {
                ticker.tick().await;
                match tx.try_send(shared.fix()) {
                    Ok(_) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        });

        if let Some(previous) = recover(self.shared.state.lock()).location.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn unsubscribe(&self) {
        if let Some(task) = recover(self.shared.state.lock()).location.take() {
            task.abort();
        }
    }

    fn latest(&self) -> Option<LocationFix> {
        Some(self.shared.fix())
    }
}

/// One reading from `termux-sensor`, normalized to G and deg/s
fn read_device(kind: SensorKind, timestamp_ms: u64) -> Option<SensorSample> {
    let sensor = match kind {
        SensorKind::Accel => "accelerometer",
        SensorKind::Gyro => "gyroscope",
    };
    let output = Command::new("termux-sensor")
        .args(["-n", "1", "-s", sensor])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let sample = parse_sensor_output(&text, kind, timestamp_ms);
    if sample.is_none() {
        warn!("[SENSOR] Unreadable {} output, using script", sensor);
    }
    sample
}

/// Parse "x=.., y=.., z=.." as printed by termux-sensor. Accelerometer values
/// arrive in m/s², gyroscope values in rad/s.
fn parse_sensor_output(output: &str, kind: SensorKind, timestamp_ms: u64) -> Option<SensorSample> {
    let mut axes = [None; 3];
    for part in output.split(',') {
        // Drop any "Accelerometer event:" style label in front of the key
        let part = part.rsplit(|c: char| c == ':' || c.is_whitespace()).next().unwrap_or("");
        let (slot, value) = if let Some(v) = part.strip_prefix("x=") {
            (0, v)
        } else if let Some(v) = part.strip_prefix("y=") {
            (1, v)
        } else if let Some(v) = part.strip_prefix("z=") {
            (2, v)
        } else {
            continue;
        };
        axes[slot] = Some(value.trim().parse::<f64>().ok()?);
    }

    let [x, y, z] = [axes[0]?, axes[1]?, axes[2]?];
    let scale = match kind {
        SensorKind::Accel => 1.0 / STANDARD_GRAVITY,
        SensorKind::Gyro => 180.0 / std::f64::consts::PI,
    };
    Some(SensorSample { timestamp_ms, kind, x: x * scale, y: y * scale, z: z * scale })
}
