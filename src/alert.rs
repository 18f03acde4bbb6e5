//! Detector lifecycle: Idle → Monitoring → Processing → Alerting →
//! Resolved | Escalated, with restart back to Monitoring and stop to Idle.
//!
//! All state lives here. The engine calls into the machine under one lock
//! from every entry point (sensor callbacks, background tick, countdown
//! task, user actions), so a transition is the only way state changes.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};
use crate::types::AlertEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectorState {
    /// No sensors attached
    Idle,
    /// Streams active, window filling
    Monitoring,
    /// One evaluation in flight
    Processing,
    /// Score exceeded threshold, countdown running
    Alerting,
    /// User confirmed they are safe
    Resolved,
    /// Countdown elapsed or help requested
    Escalated,
}

impl DetectorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DetectorState::Resolved | DetectorState::Escalated)
    }

    /// Whether incoming samples still feed the window
    pub fn accepts_samples(&self) -> bool {
        matches!(self, DetectorState::Monitoring | DetectorState::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Start,
    WindowFull,
    ScoreBelow,
    ScoreAbove,
    Acknowledge,
    RequestHelp,
    CountdownElapsed,
    Restart,
    Stop,
}

/// Pure transition table. `None` means the trigger is not legal in `state`.
pub fn transition(state: DetectorState, trigger: Trigger) -> Option<DetectorState> {
    use DetectorState::*;

    match (state, trigger) {
        (Idle, Trigger::Start) => Some(Monitoring),
        (Monitoring, Trigger::WindowFull) => Some(Processing),
        (Processing, Trigger::ScoreBelow) => Some(Monitoring),
        (Processing, Trigger::ScoreAbove) => Some(Alerting),
        (Alerting, Trigger::Acknowledge) => Some(Resolved),
        (Alerting, Trigger::RequestHelp) | (Alerting, Trigger::CountdownElapsed) => Some(Escalated),
        (Resolved, Trigger::Restart) | (Escalated, Trigger::Restart) => Some(Monitoring),
        (Idle, Trigger::Stop) => None,
        (_, Trigger::Stop) => Some(Idle),
        _ => None,
    }
}

/// Alert currently counting down
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveAlert {
    pub event: AlertEvent,
    pub remaining_secs: u32,
}

/// Result of one countdown tick
#[derive(Debug, Clone, PartialEq)]
pub enum CountdownTick {
    /// Still counting; seconds left
    Continue(u32),
    /// Reached zero and the machine moved to Escalated
    Elapsed(AlertEvent),
    /// Alert no longer active (acknowledged, escalated, stopped, or superseded)
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AlertStateMachine {
    state: DetectorState,
    active: Option<ActiveAlert>,
    countdown_secs: u32,
    next_alert_id: u64,
    transitions: u64,
}

impl AlertStateMachine {
    pub fn new(countdown_secs: u32) -> Self {
        Self {
            state: DetectorState::Idle,
            active: None,
            countdown_secs,
            next_alert_id: 1,
            transitions: 0,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn active_alert(&self) -> Option<&ActiveAlert> {
        self.active.as_ref()
    }

    /// Number of successful transitions since creation
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Apply a trigger, rejecting anything the table does not allow
    pub fn fire(&mut self, trigger: Trigger) -> Result<DetectorState> {
        let next = transition(self.state, trigger).ok_or(DetectorError::InvalidTransition {
            state: self.state,
            trigger,
        })?;
        debug!("[ENGINE] {:?} --{:?}--> {:?}", self.state, trigger, next);
        self.state = next;
        self.transitions += 1;
        if !matches!(next, DetectorState::Alerting) {
            self.active = None;
        }
        Ok(next)
    }

    pub fn start(&mut self) -> Result<()> {
        self.fire(Trigger::Start).map(|_| ())
    }

    /// Claim the single evaluation slot. False while one is already in flight
    /// or an alert is open.
    pub fn begin_evaluation(&mut self) -> bool {
        self.fire(Trigger::WindowFull).is_ok()
    }

    /// Close the evaluation slot. With an alert, the machine moves to
    /// Alerting, stamps the event id and starts counting down.
    ///
    /// Returns the raised alert. If the evaluation was abandoned meanwhile
    /// (stop), the result is discarded.
    pub fn complete_evaluation(&mut self, alert: Option<AlertEvent>) -> Option<AlertEvent> {
        if self.state != DetectorState::Processing {
            debug!("[ENGINE] Evaluation finished in {:?}, result discarded", self.state);
            return None;
        }

        match alert {
            None => {
                let _ = self.fire(Trigger::ScoreBelow);
                None
            }
            Some(mut event) => {
                self.fire(Trigger::ScoreAbove).ok()?;
                event.id = self.next_alert_id;
                self.next_alert_id += 1;
                self.active = Some(ActiveAlert {
                    event: event.clone(),
                    remaining_secs: self.countdown_secs,
                });
                Some(event)
            }
        }
    }

    /// Count one second off the alert `alert_id`.
    ///
    /// A tick for an alert that is no longer active is a no-op, so a tick
    /// racing an acknowledgment can never escalate after it.
    pub fn countdown_tick(&mut self, alert_id: u64) -> CountdownTick {
        let remaining = match self.active.as_mut() {
            Some(active) if self.state == DetectorState::Alerting && active.event.id == alert_id => {
                active.remaining_secs = active.remaining_secs.saturating_sub(1);
                active.remaining_secs
            }
            _ => return CountdownTick::Cancelled,
        };

        if remaining > 0 {
            return CountdownTick::Continue(remaining);
        }

        let event = self.active.take().map(|a| a.event);
        match (self.fire(Trigger::CountdownElapsed), event) {
            (Ok(_), Some(event)) => CountdownTick::Elapsed(event),
            _ => CountdownTick::Cancelled,
        }
    }

    /// User says they are fine. Idempotent: returns `None` when there is no
    /// open alert, including after it already escalated.
    pub fn acknowledge(&mut self) -> Option<AlertEvent> {
        self.close_alert(Trigger::Acknowledge)
    }

    /// User asks for help before the countdown ends
    pub fn request_help(&mut self) -> Option<AlertEvent> {
        self.close_alert(Trigger::RequestHelp)
    }

    fn close_alert(&mut self, trigger: Trigger) -> Option<AlertEvent> {
        if self.state != DetectorState::Alerting {
            debug!("[ENGINE] {:?} ignored in {:?}", trigger, self.state);
            return None;
        }
        let event = self.active.take().map(|a| a.event);
        self.fire(trigger).ok()?;
        event
    }

    pub fn restart(&mut self) -> Result<()> {
        self.fire(Trigger::Restart).map(|_| ())
    }

    /// Back to Idle from anywhere. Returns false if already Idle.
    pub fn stop(&mut self) -> bool {
        self.fire(Trigger::Stop).is_ok()
    }
}
