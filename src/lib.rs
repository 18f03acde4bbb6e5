//! Accident detection from phone motion sensors.
//!
//! Accelerometer and gyroscope samples are aligned into 50 ms frames, kept in
//! a 150-frame sliding window, and scored against crash patterns. A window
//! scoring above the alert threshold starts a cancellable countdown; if nobody
//! responds, emergency contacts are texted and a call prompt is raised.

pub mod aligner;
pub mod alert;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod features;
pub mod live_status;
pub mod scorer;
pub mod sensors;
pub mod synthetic;
pub mod types;
pub mod window;

#[cfg(test)]
mod testing;

pub use aligner::SampleAligner;
pub use alert::{AlertStateMachine, DetectorState, Trigger};
pub use config::{DetectorConfig, GapPolicy};
pub use engine::{Collaborators, DetectionEngine, IngestOutcome};
pub use error::{DetectorError, Result};
pub use escalation::{CallPrompt, EscalationCoordinator};
pub use features::Metrics;
pub use scorer::{Assessment, Pattern, PatternScorer};
pub use types::{AlertEvent, SensorKind, SensorSample};
pub use window::{SlidingWindow, Window};
