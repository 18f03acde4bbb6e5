//! Synthetic 7.5 s drives used by the replay tool, the live demo and tests.
//!
//! Each scenario is one full window of 20 Hz frames. `events` expands it into
//! the raw stream the engine would see: a location fix whenever the speed
//! changes (and once a second), then an accel sample and a gyro sample 5 ms
//! later for every frame.

use clap::ValueEnum;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{FusedFrame, LocationFix, SensorSample};
use crate::window::{Window, WINDOW_CAPACITY};

const FRAME_MS: u64 = 50;
const GYRO_OFFSET_MS: u64 = 5;
const FIX_EVERY_FRAMES: usize = 20;

// Fixed base position used for synthetic location fixes
const BASE_LAT: f64 = 12.9716;
const BASE_LON: f64 = 77.5946;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Steady driving with light road vibration
    Cruise,
    /// 30 G impact, 450 deg/s spin, 40 km/h to standstill, then stillness
    Crash,
    /// 18 G hit followed by a long tumble
    PhoneDrop,
    /// Single 4 G vertical jolt at constant speed
    Pothole,
    /// Sustained 1.8 G deceleration from 50 to 20 km/h
    HardBrake,
}

/// One entry of a recorded (or synthetic) sensor log
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordedEvent {
    Sensor(SensorSample),
    Location(LocationFix),
}

impl Scenario {
    pub fn all() -> [Scenario; 5] {
        [
            Scenario::Cruise,
            Scenario::Crash,
            Scenario::PhoneDrop,
            Scenario::Pothole,
            Scenario::HardBrake,
        ]
    }

    /// Frames of the scenario, stamped from t = 0
    pub fn frames(&self) -> Vec<FusedFrame> {
        (0..WINDOW_CAPACITY).map(|i| self.frame(i)).collect()
    }

    /// Frame `index` of the scenario; indices past the window hold the last frame
    pub fn frame(&self, index: usize) -> FusedFrame {
        let i = index.min(WINDOW_CAPACITY - 1);
        let (accel, gyro, speed) = self.frame_at(i);
        FusedFrame::new(index as u64 * FRAME_MS, accel, gyro, speed)
    }

    pub fn window(&self) -> Result<Window> {
        Window::try_from(self.frames())
    }

    /// Raw event stream for the scenario, stamped from `start_ms`
    pub fn events(&self, start_ms: u64) -> Vec<RecordedEvent> {
        let mut events = Vec::with_capacity(WINDOW_CAPACITY * 2 + WINDOW_CAPACITY / FIX_EVERY_FRAMES + 1);
        let mut last_speed = f64::NAN;

        for (i, frame) in self.frames().iter().enumerate() {
            let ts = start_ms + frame.timestamp_ms;
            if i % FIX_EVERY_FRAMES == 0 || frame.speed_kmh != last_speed {
                events.push(RecordedEvent::Location(LocationFix {
                    latitude: BASE_LAT + i as f64 * 1e-6,
                    longitude: BASE_LON,
                    speed_mps: Some(frame.speed_kmh / 3.6),
                    timestamp_ms: ts,
                }));
                last_speed = frame.speed_kmh;
            }
            let a = frame.accel;
            let g = frame.gyro;
            events.push(RecordedEvent::Sensor(SensorSample::accel(ts, a.x, a.y, a.z)));
            events.push(RecordedEvent::Sensor(SensorSample::gyro(ts + GYRO_OFFSET_MS, g.x, g.y, g.z)));
        }
        events
    }

    fn frame_at(&self, i: usize) -> (Vector3<f64>, Vector3<f64>, f64) {
        let rest = Vector3::new(0.0, 0.0, 1.0);
        let still = Vector3::zeros();
        let t = i as f64 * FRAME_MS as f64 / 1000.0;

        match self {
            Scenario::Cruise => {
                let wobble = Vector3::new(0.03 * (t * 7.0).sin(), 0.02 * (t * 3.0).cos(), 0.05 * (t * 11.0).sin());
                let sway = Vector3::new(0.0, 0.0, 2.0 * (t * 0.5).sin());
                (rest + wobble, sway, 40.0)
            }
            Scenario::Crash => {
                let (accel, gyro) = match i {
                    60 => (Vector3::new(30.0, 0.0, 1.0), Vector3::new(450.0, 0.0, 0.0)),
                    61 => (Vector3::new(12.0, 1.0, 1.0), Vector3::new(300.0, 40.0, 0.0)),
                    62 => (Vector3::new(4.0, 0.0, 1.0), Vector3::new(100.0, 0.0, 0.0)),
                    _ => (rest, still),
                };
                let speed = match i {
                    0..=59 => 40.0,
                    60..=79 => 40.0 * (80 - i) as f64 / 20.0,
                    _ => 0.0,
                };
                (accel, gyro, speed)
            }
            Scenario::PhoneDrop => {
                let accel = if i == 40 { Vector3::new(10.0, 14.0, 5.4) } else { rest };
                // Half the window spinning at ~566 deg/s
                let gyro = if (30..105).contains(&i) { Vector3::new(400.0, 400.0, 0.0) } else { still };
                (accel, gyro, 0.0)
            }
            Scenario::Pothole => {
                let accel = if i == 20 { Vector3::new(0.0, 0.5, 4.0) } else { rest };
                (accel, still, 40.0)
            }
            Scenario::HardBrake => {
                let (accel, speed) = match i {
                    0..=9 => (rest, 50.0),
                    10..=79 => (Vector3::new(0.0, -1.8, 1.0), 50.0 - 30.0 * (i - 10) as f64 / 70.0),
                    _ => (rest, 20.0),
                };
                (accel, still, speed)
            }
        }
    }
}
