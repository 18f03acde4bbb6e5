//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::collaborators::{
    primary_of, BackgroundScheduler, ContactResolver, EscalateFn, LocationSource, MessageSink, Notification,
    NotificationSink, ReportingSink, SensorSource, TickFn,
};
use crate::error::{recover, DetectorError, Result};
use crate::types::{
    AlertEvent, EmergencyContact, LocationFix, MedicalInfo, ReportReceipt, ReportRecord, SensorKind, SensorSample,
};

pub fn alert_event() -> AlertEvent {
    AlertEvent {
        id: 1,
        triggered_at: Utc::now(),
        peak_score: 0.9,
        peak_g_force: 30.0,
        peak_gyro: 450.0,
        location: None,
        speed_kmh: 0.0,
        sensor_data: "{}".to_string(),
    }
}

pub fn contact(name: &str, phone: &str, is_primary: bool) -> EmergencyContact {
    EmergencyContact {
        id: name.to_lowercase(),
        name: name.to_string(),
        phone: phone.to_string(),
        relationship: "family".to_string(),
        is_primary,
    }
}

// ─── Reporting ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingReporter {
    records: Mutex<Vec<ReportRecord>>,
}

impl RecordingReporter {
    pub fn records(&self) -> Vec<ReportRecord> {
        recover(self.records.lock()).clone()
    }
}

#[async_trait]
impl ReportingSink for RecordingReporter {
    async fn report(&self, record: &ReportRecord) -> Result<ReportReceipt> {
        let mut records = recover(self.records.lock());
        records.push(record.clone());
        let id = records.len() as i64;
        Ok(ReportReceipt { incident_id: Some(id), mobile_report_id: Some(id) })
    }
}

pub struct FailingReporter;

#[async_trait]
impl ReportingSink for FailingReporter {
    async fn report(&self, _record: &ReportRecord) -> Result<ReportReceipt> {
        Err(DetectorError::Reporting { status: Some(503), message: "unavailable".to_string() })
    }
}

// ─── Messaging ───────────────────────────────────────────────────────────────

/// Records texts; blank numbers fail like a real gateway would
#[derive(Default)]
pub struct RecordingMessages {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMessages {
    pub fn recipients(&self) -> Vec<String> {
        recover(self.sent.lock()).iter().map(|(phone, _)| phone.clone()).collect()
    }
}

#[async_trait]
impl MessageSink for RecordingMessages {
    async fn send_sms(&self, phone: &str, body: &str) -> Result<()> {
        if phone.is_empty() {
            return Err(DetectorError::MessageDelivery("no number".to_string()));
        }
        recover(self.sent.lock()).push((phone.to_string(), body.to_string()));
        Ok(())
    }
}

// ─── Contacts ────────────────────────────────────────────────────────────────

pub struct StaticContacts {
    contacts: Vec<EmergencyContact>,
    medical: Option<MedicalInfo>,
}

impl StaticContacts {
    pub fn new(contacts: Vec<EmergencyContact>) -> Self {
        Self { contacts, medical: None }
    }

    pub fn with_medical(mut self, medical: MedicalInfo) -> Self {
        self.medical = Some(medical);
        self
    }
}

#[async_trait]
impl ContactResolver for StaticContacts {
    async fn primary_contact(&self) -> Result<Option<EmergencyContact>> {
        Ok(primary_of(&self.contacts).cloned())
    }

    async fn emergency_contacts(&self) -> Result<Vec<EmergencyContact>> {
        Ok(self.contacts.clone())
    }

    async fn medical_info(&self) -> Result<Option<MedicalInfo>> {
        Ok(self.medical.clone())
    }
}

// ─── Notifications ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        recover(self.notifications.lock()).clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.notifications().into_iter().map(|n| n.body).collect()
    }

    pub fn titles(&self) -> Vec<String> {
        self.notifications().into_iter().map(|n| n.title).collect()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        recover(self.notifications.lock()).push(notification.clone());
    }
}

// ─── Sensors ─────────────────────────────────────────────────────────────────

/// Sensor and location source driven by the test
#[derive(Default)]
pub struct ManualSensors {
    rates: Mutex<Vec<(SensorKind, u32)>>,
    senders: Mutex<HashMap<SensorKind, mpsc::Sender<SensorSample>>>,
    location_tx: Mutex<Option<mpsc::Sender<LocationFix>>>,
    pending: Mutex<Vec<SensorSample>>,
    latest: Mutex<Option<LocationFix>>,
}

impl ManualSensors {
    pub fn rates(&self) -> Vec<(SensorKind, u32)> {
        recover(self.rates.lock()).clone()
    }

    pub fn is_subscribed(&self, kind: SensorKind) -> bool {
        recover(self.senders.lock()).contains_key(&kind)
    }

    /// Push a sample through the subscription, as a platform callback would
    pub fn emit(&self, sample: SensorSample) -> bool {
        recover(self.senders.lock())
            .get(&sample.kind)
            .map(|tx| tx.try_send(sample).is_ok())
            .unwrap_or(false)
    }

    pub fn emit_location(&self, fix: LocationFix) -> bool {
        recover(self.location_tx.lock())
            .as_ref()
            .map(|tx| tx.try_send(fix).is_ok())
            .unwrap_or(false)
    }

    /// Queue a sample for the next `poll`
    pub fn queue(&self, sample: SensorSample) {
        recover(self.pending.lock()).push(sample);
    }

    pub fn set_latest(&self, fix: LocationFix) {
        *recover(self.latest.lock()) = Some(fix);
    }
}

impl SensorSource for ManualSensors {
    fn set_rate(&self, kind: SensorKind, hz: u32) -> Result<()> {
        recover(self.rates.lock()).push((kind, hz));
        Ok(())
    }

    fn subscribe(&self, kind: SensorKind, tx: mpsc::Sender<SensorSample>) -> Result<()> {
        recover(self.senders.lock()).insert(kind, tx);
        Ok(())
    }

    fn unsubscribe(&self, kind: SensorKind) {
        recover(self.senders.lock()).remove(&kind);
    }

    fn poll(&self) -> Vec<SensorSample> {
        std::mem::take(&mut *recover(self.pending.lock()))
    }
}

impl LocationSource for ManualSensors {
    fn subscribe(&self, tx: mpsc::Sender<LocationFix>) -> Result<()> {
        *recover(self.location_tx.lock()) = Some(tx);
        Ok(())
    }

    fn unsubscribe(&self) {
        recover(self.location_tx.lock()).take();
    }

    fn latest(&self) -> Option<LocationFix> {
        *recover(self.latest.lock())
    }
}

// ─── Background ──────────────────────────────────────────────────────────────

pub struct FailingScheduler;

impl BackgroundScheduler for FailingScheduler {
    fn start(&self, _on_tick: TickFn, _on_escalate: EscalateFn) -> Result<()> {
        Err(DetectorError::BackgroundStart("background execution not permitted".to_string()))
    }

    fn stop(&self) {}
}

/// Keeps the callbacks so the test can tick by hand
#[derive(Default)]
pub struct ManualScheduler {
    callbacks: Mutex<Option<(TickFn, EscalateFn)>>,
}

impl ManualScheduler {
    pub fn is_running(&self) -> bool {
        recover(self.callbacks.lock()).is_some()
    }

    /// Run one tick, forwarding a raised alert to `on_escalate`
    pub fn tick(&self) -> Option<AlertEvent> {
        let callbacks = recover(self.callbacks.lock()).clone();
        let (on_tick, on_escalate) = callbacks?;
        let alert = on_tick();
        if let Some(alert) = &alert {
            on_escalate(alert.clone());
        }
        alert
    }
}

impl BackgroundScheduler for ManualScheduler {
    fn start(&self, on_tick: TickFn, on_escalate: EscalateFn) -> Result<()> {
        *recover(self.callbacks.lock()) = Some((on_tick, on_escalate));
        Ok(())
    }

    fn stop(&self) {
        recover(self.callbacks.lock()).take();
    }
}
