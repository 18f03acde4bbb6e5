//! Detection pipeline: alignment, windowing, scoring and the alert lifecycle
//! behind one lock.
//!
//! Three kinds of callers drive it concurrently: the sample/location
//! consumer tasks fed by the sensor sources, the background tick, and the
//! countdown task plus user actions. Every one of them takes `core` for a
//! short critical section; scoring runs outside it, guarded by the
//! Processing state, and all I/O is spawned onto the runtime.

use log::{debug, info, warn};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aligner::SampleAligner;
use crate::alert::{AlertStateMachine, CountdownTick, DetectorState};
use crate::collaborators::{
    BackgroundScheduler, ContactResolver, EscalateFn, LocationSource, MessageSink, Notification, NotificationKind,
    NotificationSink, ReportingSink, SensorSource, TickFn,
};
use crate::config::DetectorConfig;
use crate::error::{recover, DetectorError, Result};
use crate::escalation::{CallPrompt, EscalationCoordinator};
use crate::live_status::{current_timestamp, EngineStatus};
use crate::scorer::{Assessment, PatternScorer};
use crate::types::{AlertEvent, GForceLevel, LocationFix, SensorKind, SensorSample};
use crate::window::Window;

const SAMPLE_QUEUE: usize = 512;
const LOCATION_QUEUE: usize = 16;
const REPORT_FORMAT_VERSION: u32 = 1;

/// Everything the engine talks to
pub struct Collaborators {
    pub sensors: Arc<dyn SensorSource>,
    pub location: Arc<dyn LocationSource>,
    pub reporter: Arc<dyn ReportingSink>,
    pub messages: Arc<dyn MessageSink>,
    pub contacts: Arc<dyn ContactResolver>,
    pub notifier: Arc<dyn NotificationSink>,
    pub background: Arc<dyn BackgroundScheduler>,
}

/// What one `ingest` call did
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Not monitoring, or the sample was stale
    Dropped,
    /// Stored; the window is not ready for evaluation
    Buffered,
    /// Window full while an evaluation or alert was already in progress
    EvaluationSkipped,
    Evaluated { score: f64, alert: Option<AlertEvent> },
}

#[derive(Debug, Clone, Copy, Default)]
struct Telemetry {
    g_force: f64,
    max_g_force: f64,
    gyro_intensity: f64,
    max_gyro_intensity: f64,
}

impl Telemetry {
    fn observe(&mut self, sample: &SensorSample) {
        let magnitude = sample.magnitude();
        match sample.kind {
            SensorKind::Accel => {
                self.g_force = magnitude;
                self.max_g_force = self.max_g_force.max(magnitude);
            }
            SensorKind::Gyro => {
                self.gyro_intensity = magnitude;
                self.max_gyro_intensity = self.max_gyro_intensity.max(magnitude);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    accel_samples: u64,
    gyro_samples: u64,
    location_fixes: u64,
    dropped_samples: u64,
    evaluations: u64,
    skipped_evaluations: u64,
    alerts_raised: u64,
    resolutions: u64,
    escalations: u64,
}

struct EngineCore {
    machine: AlertStateMachine,
    aligner: SampleAligner,
    location: Option<LocationFix>,
    countdown: Option<JoinHandle<()>>,
    sample_consumer: Option<JoinHandle<()>>,
    location_consumer: Option<JoinHandle<()>>,
    telemetry: Telemetry,
    counters: Counters,
    last_assessment: Option<Assessment>,
    call_prompt: Option<CallPrompt>,
    background_active: bool,
    started_at: Option<Instant>,
}

struct EngineInner {
    config: DetectorConfig,
    scorer: PatternScorer,
    sensors: Arc<dyn SensorSource>,
    location: Arc<dyn LocationSource>,
    background: Arc<dyn BackgroundScheduler>,
    coordinator: EscalationCoordinator,
    runtime: Handle,
    core: Mutex<EngineCore>,
}

/// Shared handle to one detection pipeline. Clones drive the same engine.
#[derive(Clone)]
pub struct DetectionEngine {
    inner: Arc<EngineInner>,
}

impl DetectionEngine {
    /// Build an engine bound to the current tokio runtime
    pub fn new(config: DetectorConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| DetectorError::NoRuntime(e.to_string()))?;

        let coordinator = EscalationCoordinator::new(
            collaborators.reporter,
            collaborators.messages,
            collaborators.contacts,
            collaborators.notifier,
            &config,
        );
        let core = EngineCore {
            machine: AlertStateMachine::new(config.countdown_secs),
            aligner: SampleAligner::from_config(&config),
            location: None,
            countdown: None,
            sample_consumer: None,
            location_consumer: None,
            telemetry: Telemetry::default(),
            counters: Counters::default(),
            last_assessment: None,
            call_prompt: None,
            background_active: false,
            started_at: None,
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                scorer: PatternScorer::new(),
                sensors: collaborators.sensors,
                location: collaborators.location,
                background: collaborators.background,
                coordinator,
                runtime,
                core: Mutex::new(core),
            }),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> DetectorState {
        self.lock_core().machine.state()
    }

    fn lock_core(&self) -> MutexGuard<'_, EngineCore> {
        recover(self.inner.core.lock())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Attach sensors and location, then try to keep running in the
    /// background. Refuses without emergency contacts when configured to.
    pub async fn start_monitoring(&self) -> Result<()> {
        if self.inner.config.require_contacts {
            let contacts = self.inner.coordinator.contacts().emergency_contacts().await?;
            if contacts.is_empty() {
                warn!("[ENGINE] Refusing to start: no emergency contacts");
                return Err(DetectorError::NoEmergencyContacts);
            }
        }

        {
            let mut core = self.lock_core();
            core.machine.start()?;
            core.aligner.clear();
            core.started_at = Some(Instant::now());

            if let Err(e) = self.attach_sensors(&mut core) {
                self.detach_all(&mut core);
                core.machine.stop();
                return Err(e);
            }
            self.attach_location(&mut core);
        }

        self.enable_background();
        self.inner.coordinator.notify(Notification::status(
            "Accident Detection Active",
            "Monitoring for accidents",
        ));
        info!(
            "[ENGINE] Monitoring started at {} Hz, gap policy {:?}",
            self.inner.config.sampling_rate_hz, self.inner.config.gap_policy
        );
        Ok(())
    }

    /// Resume monitoring after an alert was resolved or escalated
    pub fn restart(&self) -> Result<()> {
        let mut core = self.lock_core();
        core.machine.restart()?;
        core.aligner.clear();
        core.call_prompt = None;

        if let Err(e) = self.attach_sensors(&mut core) {
            warn!("[ENGINE] Restart failed to attach sensors: {}", e);
            self.detach_all(&mut core);
            core.machine.stop();
            return Err(e);
        }
        info!("[ENGINE] Monitoring resumed");
        Ok(())
    }

    /// Detach everything and go Idle from any state. Cancels a running
    /// countdown. Returns false if the engine was already idle.
    pub fn stop(&self) -> bool {
        let stopped = {
            let mut core = self.lock_core();
            if let Some(countdown) = core.countdown.take() {
                countdown.abort();
            }
            let stopped = core.machine.stop();
            self.detach_all(&mut core);
            core.aligner.clear();
            core.background_active = false;
            stopped
        };

        self.inner.background.stop();
        if stopped {
            info!("[ENGINE] Monitoring stopped");
        }
        stopped
    }

    fn attach_sensors(&self, core: &mut EngineCore) -> Result<()> {
        let hz = self.inner.config.sampling_rate_hz;
        let sensors = &self.inner.sensors;
        sensors.set_rate(SensorKind::Accel, hz)?;
        sensors.set_rate(SensorKind::Gyro, hz)?;

        // Both streams share one queue so a single consumer serializes them
        let (tx, mut rx) = mpsc::channel::<SensorSample>(SAMPLE_QUEUE);
        sensors.subscribe(SensorKind::Accel, tx.clone())?;
        sensors.subscribe(SensorKind::Gyro, tx)?;

        let engine = self.clone();
        core.sample_consumer = Some(self.inner.runtime.spawn(async move {
            while let Some(sample) = rx.recv().await {
                engine.ingest(&sample);
            }
            debug!("[ENGINE] Sample stream closed");
        }));
        Ok(())
    }

    fn attach_location(&self, core: &mut EngineCore) {
        let (tx, mut rx) = mpsc::channel::<LocationFix>(LOCATION_QUEUE);
        if let Err(e) = self.inner.location.subscribe(tx) {
            warn!("[ENGINE] Location unavailable, speed stays at last value: {}", e);
            return;
        }

        let engine = self.clone();
        core.location_consumer = Some(self.inner.runtime.spawn(async move {
            while let Some(fix) = rx.recv().await {
                engine.update_location(fix);
            }
        }));
    }

    fn detach_sensors(&self, core: &mut EngineCore) {
        self.inner.sensors.unsubscribe(SensorKind::Accel);
        self.inner.sensors.unsubscribe(SensorKind::Gyro);
        if let Some(consumer) = core.sample_consumer.take() {
            consumer.abort();
        }
    }

    fn detach_all(&self, core: &mut EngineCore) {
        self.detach_sensors(core);
        self.inner.location.unsubscribe();
        if let Some(consumer) = core.location_consumer.take() {
            consumer.abort();
        }
    }

    /// Hand the background scheduler a tick that runs this pipeline. A
    /// scheduler that cannot start leaves the engine in foreground-only mode.
    /// Does nothing while Idle.
    pub fn enable_background(&self) -> bool {
        if self.state() == DetectorState::Idle {
            debug!("[BACKGROUND] Not started, engine is idle");
            return false;
        }

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let on_tick: TickFn = Arc::new(move || {
            weak.upgrade()
                .and_then(|inner| DetectionEngine { inner }.background_tick())
        });

        let coordinator = self.inner.coordinator.clone();
        let on_escalate: EscalateFn = Arc::new(move |alert: AlertEvent| {
            coordinator.notify(Notification::new(
                NotificationKind::Alert,
                "Accident detected",
                format!("Alert #{} raised while running in the background", alert.id),
            ));
        });

        match self.inner.background.start(on_tick, on_escalate) {
            Ok(()) => {
                let mut core = self.lock_core();
                if core.machine.state() == DetectorState::Idle {
                    // Stopped while the scheduler was starting
                    drop(core);
                    self.inner.background.stop();
                    return false;
                }
                core.background_active = true;
                true
            }
            Err(e) => {
                warn!("[BACKGROUND] {}; continuing in foreground only", e);
                self.lock_core().background_active = false;
                self.inner.coordinator.notify(Notification::status(
                    "Background monitoring unavailable",
                    "Keep the app open to stay protected",
                ));
                false
            }
        }
    }

    pub fn disable_background(&self) {
        self.inner.background.stop();
        self.lock_core().background_active = false;
        info!("[BACKGROUND] Disabled, foreground only");
    }

    // ── Pipeline ─────────────────────────────────────────────────────────────

    /// Feed one sample through alignment and, once the window is full and no
    /// evaluation is in flight, score it.
    pub fn ingest(&self, sample: &SensorSample) -> IngestOutcome {
        let (window, speed_kmh, location) = {
            let mut core = self.lock_core();
            if !core.machine.state().accepts_samples() {
                core.counters.dropped_samples += 1;
                return IngestOutcome::Dropped;
            }

            if let Err(e) = core.aligner.ingest(sample) {
                core.counters.dropped_samples += 1;
                debug!("[ALIGN] {}", e);
                return IngestOutcome::Dropped;
            }
            match sample.kind {
                SensorKind::Accel => core.counters.accel_samples += 1,
                SensorKind::Gyro => core.counters.gyro_samples += 1,
            }
            core.telemetry.observe(sample);

            if !core.aligner.is_full() {
                return IngestOutcome::Buffered;
            }
            if core.machine.state() != DetectorState::Monitoring {
                core.counters.skipped_evaluations += 1;
                debug!("[ENGINE] Window full during {:?}, evaluation skipped", core.machine.state());
                return IngestOutcome::EvaluationSkipped;
            }
            let Some(window) = core.aligner.snapshot() else {
                return IngestOutcome::Buffered;
            };
            if !core.machine.begin_evaluation() {
                return IngestOutcome::EvaluationSkipped;
            }
            (window, core.aligner.speed_kmh(), core.location)
        };

        let started = Instant::now();
        let assessment = self.inner.scorer.assess(&window);
        debug!(
            "[ENGINE] score={:.2} patterns={:?} peak_g={:.2} peak_gyro={:.1} in {:?}",
            assessment.score,
            assessment.fired,
            assessment.metrics.max_accel_spike,
            assessment.metrics.max_gyro,
            started.elapsed()
        );

        let score = assessment.score;
        let candidate = assessment
            .exceeds(self.inner.config.alert_threshold)
            .then(|| build_alert(&assessment, &window, speed_kmh, location));

        let raised = {
            let mut core = self.lock_core();
            core.counters.evaluations += 1;
            core.last_assessment = Some(assessment);
            let raised = core.machine.complete_evaluation(candidate);
            if let Some(alert) = &raised {
                self.enter_alerting(&mut core, alert);
            }
            raised
        };

        if let Some(alert) = &raised {
            self.inner.coordinator.dispatch_alert(&self.inner.runtime, alert);
        }
        IngestOutcome::Evaluated { score, alert: raised }
    }

    fn enter_alerting(&self, core: &mut EngineCore, alert: &AlertEvent) {
        core.counters.alerts_raised += 1;
        core.aligner.clear();
        self.detach_sensors(core);

        if let Some(previous) = core.countdown.take() {
            previous.abort();
        }
        core.countdown = Some(self.spawn_countdown(alert.id));

        warn!(
            "[ENGINE] ALERT #{} score={:.2} peak_g={:.1} peak_gyro={:.0} speed={:.1}km/h",
            alert.id, alert.peak_score, alert.peak_g_force, alert.peak_gyro, alert.speed_kmh
        );
    }

    /// Latest fix wins. Speed seeds every frame created from now on.
    pub fn update_location(&self, fix: LocationFix) {
        let mut core = self.lock_core();
        core.counters.location_fixes += 1;
        if let Some(speed_kmh) = fix.speed_kmh() {
            core.aligner.set_speed_kmh(speed_kmh);
        }
        core.location = Some(fix);
    }

    /// One background tick: pick up the latest fix, drain whatever the sensor
    /// source buffered, and run it through the same pipeline.
    pub fn background_tick(&self) -> Option<AlertEvent> {
        let last_fix_ms = {
            let core = self.lock_core();
            if !core.machine.state().accepts_samples() {
                return None;
            }
            core.location.map(|l| l.timestamp_ms)
        };

        if let Some(fix) = self.inner.location.latest() {
            if last_fix_ms != Some(fix.timestamp_ms) {
                self.update_location(fix);
            }
        }

        let mut raised = None;
        for sample in self.inner.sensors.poll() {
            if let IngestOutcome::Evaluated { alert: Some(alert), .. } = self.ingest(&sample) {
                raised = Some(alert);
            }
        }
        raised
    }

    // ── Countdown and user actions ───────────────────────────────────────────

    fn spawn_countdown(&self, alert_id: u64) -> JoinHandle<()> {
        let engine = self.clone();
        self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.countdown_tick(alert_id) {
                    CountdownTick::Continue(remaining) => {
                        debug!("[ESCALATE] Alert #{} escalates in {}s", alert_id, remaining)
                    }
                    CountdownTick::Elapsed(alert) => {
                        info!("[ESCALATE] Alert #{} not acknowledged, escalating", alert_id);
                        engine.finish_escalation(alert).await;
                        break;
                    }
                    CountdownTick::Cancelled => break,
                }
            }
        })
    }

    /// Advance the countdown of `alert_id` by one second under the engine lock
    fn countdown_tick(&self, alert_id: u64) -> CountdownTick {
        let mut core = self.lock_core();
        let tick = core.machine.countdown_tick(alert_id);
        if matches!(tick, CountdownTick::Elapsed(_)) {
            // The countdown task is finishing on its own; detach it so a later
            // stop cannot abort the escalation mid-flight
            core.countdown = None;
            core.counters.escalations += 1;
        }
        tick
    }

    async fn finish_escalation(&self, alert: AlertEvent) -> CallPrompt {
        let prompt = self.inner.coordinator.escalate(&alert).await;
        self.lock_core().call_prompt = Some(prompt.clone());
        prompt
    }

    /// The user is fine. Cancels the countdown before the transition, so a
    /// pending tick finds no active alert. No-op unless Alerting.
    pub fn acknowledge(&self) -> bool {
        let resolved = {
            let mut core = self.lock_core();
            if core.machine.state() != DetectorState::Alerting {
                debug!("[ENGINE] Acknowledge ignored in {:?}", core.machine.state());
                return false;
            }
            if let Some(countdown) = core.countdown.take() {
                countdown.abort();
            }
            let resolved = core.machine.acknowledge();
            if resolved.is_some() {
                core.counters.resolutions += 1;
            }
            resolved
        };

        match resolved {
            Some(alert) => {
                info!("[ENGINE] Alert #{} acknowledged, resolved", alert.id);
                self.inner.coordinator.notify(Notification::status("Alert cancelled", "Glad you're safe"));
                true
            }
            None => false,
        }
    }

    /// Escalate now instead of waiting for the countdown
    pub async fn request_help(&self) -> Option<CallPrompt> {
        let alert = {
            let mut core = self.lock_core();
            if core.machine.state() != DetectorState::Alerting {
                return None;
            }
            if let Some(countdown) = core.countdown.take() {
                countdown.abort();
            }
            let alert = core.machine.request_help()?;
            core.counters.escalations += 1;
            alert
        };

        info!("[ESCALATE] Help requested for alert #{}", alert.id);
        Some(self.finish_escalation(alert).await)
    }

    // ── Status ───────────────────────────────────────────────────────────────

    pub fn status(&self) -> EngineStatus {
        let core = self.lock_core();
        let active = core.machine.active_alert();
        let (last_score, last_patterns) = core
            .last_assessment
            .as_ref()
            .map(|a| (a.score, a.fired.clone()))
            .unwrap_or_default();

        EngineStatus {
            timestamp: current_timestamp(),
            state: core.machine.state(),
            uptime_seconds: core.started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0),
            accel_samples: core.counters.accel_samples,
            gyro_samples: core.counters.gyro_samples,
            location_fixes: core.counters.location_fixes,
            dropped_samples: core.counters.dropped_samples,
            merged_samples: core.aligner.merged_samples(),
            stale_samples: core.aligner.stale_samples(),
            frames_buffered: core.aligner.len(),
            evaluations: core.counters.evaluations,
            skipped_evaluations: core.counters.skipped_evaluations,
            last_score,
            last_patterns,
            alerts_raised: core.counters.alerts_raised,
            resolutions: core.counters.resolutions,
            escalations: core.counters.escalations,
            active_alert_id: active.map(|a| a.event.id),
            countdown_remaining: active.map(|a| a.remaining_secs),
            call_prompt: core.call_prompt.clone(),
            g_force: core.telemetry.g_force,
            max_g_force: core.telemetry.max_g_force,
            g_force_level: GForceLevel::classify(core.telemetry.g_force),
            gyro_intensity: core.telemetry.gyro_intensity,
            max_gyro_intensity: core.telemetry.max_gyro_intensity,
            speed_kmh: core.aligner.speed_kmh(),
            latitude: core.location.map(|l| l.latitude),
            longitude: core.location.map(|l| l.longitude),
            background_active: core.background_active,
            reporting: self.inner.coordinator.stats(),
        }
    }
}

/// Alert for a window that crossed the threshold. `sensor_data` carries the
/// metrics and the full window so the server can review what was seen.
fn build_alert(
    assessment: &Assessment,
    window: &Window,
    speed_kmh: f64,
    location: Option<LocationFix>,
) -> AlertEvent {
    let sensor_data = json!({
        "version": REPORT_FORMAT_VERSION,
        "source": "accident_detector_rs",
        "event_type": "CRASH_DETECTED",
        "score": assessment.score,
        "patterns": assessment.fired,
        "metrics": assessment.metrics,
        "frames": window.frames(),
    });

    AlertEvent {
        id: 0,
        triggered_at: chrono::Utc::now(),
        peak_score: assessment.score,
        peak_g_force: assessment.metrics.max_accel_spike,
        peak_gyro: assessment.metrics.max_gyro,
        location,
        speed_kmh,
        sensor_data: sensor_data.to_string(),
    }
}
