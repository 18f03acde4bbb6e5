use std::sync::{LockResult, PoisonError};
use thiserror::Error;

use crate::alert::{DetectorState, Trigger};

/// Accident detector error types
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Transition {trigger:?} not allowed from {state:?}")]
    InvalidTransition {
        state: DetectorState,
        trigger: Trigger,
    },

    #[error("Stale sample at {timestamp_ms}ms (newest frame at {newest_ms}ms)")]
    StaleSample { timestamp_ms: u64, newest_ms: u64 },

    #[error("Window needs {expected} frames, got {actual}")]
    IncompleteWindow { expected: usize, actual: usize },

    #[error("No emergency contacts configured")]
    NoEmergencyContacts,

    #[error("Reporting failed: {message}")]
    Reporting { status: Option<u16>, message: String },

    #[error("Message delivery failed: {0}")]
    MessageDelivery(String),

    #[error("Background scheduler failed to start: {0}")]
    BackgroundStart(String),

    #[error("Sensor failed: {0}")]
    SensorFailed(String),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DetectorError {
    /// Failures the engine logs and survives. Everything in this crate is
    /// recoverable except a missing runtime at construction time.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DetectorError::NoRuntime(_))
    }
}

impl From<reqwest::Error> for DetectorError {
    fn from(e: reqwest::Error) -> Self {
        DetectorError::Reporting {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

/// Result type for detector operations
pub type Result<T> = std::result::Result<T, DetectorError>;

/// Take a lock even if a panicking holder poisoned it
pub(crate) fn recover<T>(result: LockResult<T>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DetectorError::IncompleteWindow {
            expected: 150,
            actual: 12,
        };
        assert_eq!(err.to_string(), "Window needs 150 frames, got 12");

        let err = DetectorError::InvalidTransition {
            state: DetectorState::Idle,
            trigger: Trigger::Acknowledge,
        };
        assert!(err.to_string().contains("Acknowledge"));
    }

    #[test]
    fn test_recoverable() {
        assert!(DetectorError::NoEmergencyContacts.is_recoverable());
        assert!(!DetectorError::NoRuntime("none".to_string()).is_recoverable());
    }
}
