//! Narrow interfaces to everything outside the detection core, plus the
//! concrete adapters shipped with the crate.
//!
//! The engine only ever holds `Arc<dyn Trait>` handles, so every one of
//! these can be swapped for a test double.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{recover, DetectorError, Result};
use crate::types::{
    AlertEvent, EmergencyContact, LocationFix, MedicalInfo, ReportReceipt, ReportRecord, SensorKind,
    SensorSample,
};

// ─── Sensors ─────────────────────────────────────────────────────────────────

/// Accelerometer / gyroscope event source
pub trait SensorSource: Send + Sync {
    fn set_rate(&self, kind: SensorKind, hz: u32) -> Result<()>;

    /// Start delivering `kind` samples into `tx`. Dropping the sender side
    /// (on unsubscribe) closes the stream.
    fn subscribe(&self, kind: SensorKind, tx: mpsc::Sender<SensorSample>) -> Result<()>;

    fn unsubscribe(&self, kind: SensorKind);

    /// Samples read directly, for the background tick while callbacks are
    /// suspended
    fn poll(&self) -> Vec<SensorSample>;
}

/// Periodic position fixes. The engine only keeps the latest.
pub trait LocationSource: Send + Sync {
    fn subscribe(&self, tx: mpsc::Sender<LocationFix>) -> Result<()>;
    fn unsubscribe(&self);
    fn latest(&self) -> Option<LocationFix>;
}

// ─── Outbound sinks ──────────────────────────────────────────────────────────

/// Incident reporting server. Best effort: failures are logged, never retried.
#[async_trait]
pub trait ReportingSink: Send + Sync {
    async fn report(&self, record: &ReportRecord) -> Result<ReportReceipt>;
}

/// Text message gateway used for the emergency contact fan-out
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_sms(&self, phone: &str, body: &str) -> Result<()>;
}

/// Read-only view of the user's contact list and medical info
#[async_trait]
pub trait ContactResolver: Send + Sync {
    async fn primary_contact(&self) -> Result<Option<EmergencyContact>>;
    async fn emergency_contacts(&self) -> Result<Vec<EmergencyContact>>;
    async fn medical_info(&self) -> Result<Option<MedicalInfo>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Alert,
    Status,
    CallPrompt,
    Medical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self { kind, title: title.into(), body: body.into() }
    }

    pub fn status(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(NotificationKind::Status, title, body)
    }
}

/// OS notification or in-app modal. Must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

// ─── Background execution ────────────────────────────────────────────────────

/// Called on every background tick; returns an alert if the tick raised one
pub type TickFn = Arc<dyn Fn() -> Option<AlertEvent> + Send + Sync>;
/// Called when a background tick raised an alert
pub type EscalateFn = Arc<dyn Fn(AlertEvent) + Send + Sync>;

/// Keeps monitoring alive while the app is not in the foreground
pub trait BackgroundScheduler: Send + Sync {
    fn start(&self, on_tick: TickFn, on_escalate: EscalateFn) -> Result<()>;
    fn stop(&self);
}

// ─── HTTP reporting ──────────────────────────────────────────────────────────

/// Posts `ReportRecord`s as a form to the incident server.
///
/// The server answers with `{"incident_id": .., "mobile_report_id": ..}` on
/// success and `{"error": ..}` otherwise.
pub struct HttpReportingSink {
    client: reqwest::Client,
    url: String,
}

impl HttpReportingSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReportingSink for HttpReportingSink {
    async fn report(&self, record: &ReportRecord) -> Result<ReportReceipt> {
        let response = self.client.post(&self.url).form(record).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectorError::Reporting {
                status: Some(status.as_u16()),
                message: body,
            });
        }

        Ok(response.json::<ReportReceipt>().await?)
    }
}

// ─── Messaging ───────────────────────────────────────────────────────────────

/// Writes outgoing messages to the log instead of a carrier gateway
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessageSink;

#[async_trait]
impl MessageSink for LogMessageSink {
    async fn send_sms(&self, phone: &str, body: &str) -> Result<()> {
        if phone.trim().is_empty() {
            return Err(DetectorError::MessageDelivery("empty phone number".to_string()));
        }
        info!("[ESCALATE] SMS to {}:\n{}", phone, body);
        Ok(())
    }
}

// ─── Contacts ────────────────────────────────────────────────────────────────

/// First contact flagged primary, else the first contact
pub fn primary_of(contacts: &[EmergencyContact]) -> Option<&EmergencyContact> {
    contacts.iter().find(|c| c.is_primary).or_else(|| contacts.first())
}

/// On-disk contact book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactBook {
    #[serde(default)]
    pub contacts: Vec<EmergencyContact>,
    #[serde(default)]
    pub medical_info: Option<MedicalInfo>,
}

/// Contact resolver backed by a JSON `ContactBook`, loaded once
#[derive(Debug, Clone, Default)]
pub struct JsonContactStore {
    book: ContactBook,
}

impl JsonContactStore {
    pub fn new(book: ContactBook) -> Self {
        Self { book }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let book: ContactBook = serde_json::from_str(&text)?;
        debug!("[ESCALATE] Loaded {} contact(s) from {}", book.contacts.len(), path.display());
        Ok(Self { book })
    }
}

#[async_trait]
impl ContactResolver for JsonContactStore {
    async fn primary_contact(&self) -> Result<Option<EmergencyContact>> {
        Ok(primary_of(&self.book.contacts).cloned())
    }

    async fn emergency_contacts(&self) -> Result<Vec<EmergencyContact>> {
        Ok(self.book.contacts.clone())
    }

    async fn medical_info(&self) -> Result<Option<MedicalInfo>> {
        Ok(self.book.medical_info.clone().filter(|m| !m.is_empty()))
    }
}

// ─── Notifications ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: &Notification) {
        match notification.kind {
            NotificationKind::Alert | NotificationKind::CallPrompt => {
                warn!("[NOTIFY] {}: {}", notification.title, notification.body)
            }
            _ => info!("[NOTIFY] {}: {}", notification.title, notification.body),
        }
    }
}

// ─── Tokio background scheduler ──────────────────────────────────────────────

/// Runs the tick callback on a tokio interval and refreshes the ongoing
/// "monitoring" notification every `notify_every` ticks.
pub struct TokioBackgroundScheduler {
    tick: Duration,
    notify_every: u64,
    notifier: Arc<dyn NotificationSink>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokioBackgroundScheduler {
    pub fn new(tick: Duration, notify_every: u64, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            tick,
            notify_every,
            notifier,
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        recover(self.task.lock()).as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl BackgroundScheduler for TokioBackgroundScheduler {
    fn start(&self, on_tick: TickFn, on_escalate: EscalateFn) -> Result<()> {
        if self.tick.is_zero() {
            return Err(DetectorError::BackgroundStart("tick interval is zero".to_string()));
        }
        let runtime = Handle::try_current().map_err(|e| DetectorError::BackgroundStart(e.to_string()))?;

        let tick = self.tick;
        let notify_every = self.notify_every;
        let notifier = self.notifier.clone();

        let mut task = recover(self.task.lock());
        if let Some(previous) = task.take() {
            previous.abort();
        }

        *task = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = 0u64;

            loop {
                interval.tick().await;
                ticks += 1;

                if let Some(alert) = on_tick() {
                    on_escalate(alert);
                }

                if notify_every > 0 && ticks % notify_every == 0 {
                    let secs = ticks * tick.as_millis() as u64 / 1000;
                    notifier.notify(&Notification::status(
                        "Accident Detection Active",
                        format!("Monitoring... ({}s)", secs),
                    ));
                }
            }
        }));

        info!("[BACKGROUND] Started, tick {}ms", tick.as_millis());
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = recover(self.task.lock()).take() {
            task.abort();
            info!("[BACKGROUND] Stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingNotifier;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn contact(name: &str, primary: bool) -> EmergencyContact {
        EmergencyContact {
            id: name.to_lowercase(),
            name: name.to_string(),
            phone: "+15550100".to_string(),
            relationship: "friend".to_string(),
            is_primary: primary,
        }
    }

    #[test]
    fn test_primary_contact_selection() {
        let contacts = vec![contact("Ann", false), contact("Bob", true)];
        assert_eq!(primary_of(&contacts).map(|c| c.name.as_str()), Some("Bob"));

        let contacts = vec![contact("Ann", false), contact("Cy", false)];
        assert_eq!(primary_of(&contacts).map(|c| c.name.as_str()), Some("Ann"));

        assert!(primary_of(&[]).is_none());
    }

    #[tokio::test]
    async fn test_contact_book_from_file() {
        let path = std::env::temp_dir().join(format!("contacts_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{
                "contacts": [
                    {"name": "Ann", "phone": "+15550101"},
                    {"name": "Bob", "phone": "+15550102", "isPrimary": true}
                ],
                "medicalInfo": {"bloodType": "O+", "allergies": "penicillin"}
            }"#,
        )
        .unwrap();

        let store = JsonContactStore::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(store.emergency_contacts().await.unwrap().len(), 2);
        assert_eq!(store.primary_contact().await.unwrap().unwrap().name, "Bob");
        let medical = store.medical_info().await.unwrap().unwrap();
        assert_eq!(medical.blood_type, "O+");
    }

    #[tokio::test]
    async fn test_empty_medical_info_is_none() {
        let store = JsonContactStore::new(ContactBook {
            contacts: vec![],
            medical_info: Some(MedicalInfo::default()),
        });
        assert!(store.medical_info().await.unwrap().is_none());
        assert!(store.primary_contact().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_log_message_sink_rejects_blank_number() {
        let sink = LogMessageSink;
        assert!(sink.send_sms("+15550100", "hi").await.is_ok());
        assert!(matches!(sink.send_sms("  ", "hi").await, Err(DetectorError::MessageDelivery(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_ticks_and_refreshes_notification() {
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = TokioBackgroundScheduler::new(Duration::from_millis(50), 200, notifier.clone());

        let ticks = Arc::new(AtomicU64::new(0));
        let escalated = Arc::new(AtomicU64::new(0));
        let tick_count = ticks.clone();
        let escalate_count = escalated.clone();

        scheduler
            .start(
                Arc::new(move || {
                    tick_count.fetch_add(1, Ordering::SeqCst);
                    None
                }),
                Arc::new(move |_| {
                    escalate_count.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(10_020)).await;
        scheduler.stop();

        assert!(ticks.load(Ordering::SeqCst) >= 200);
        assert_eq!(escalated.load(Ordering::SeqCst), 0);
        let statuses = notifier.bodies();
        assert_eq!(statuses.first().map(String::as_str), Some("Monitoring... (10s)"));
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_background_start_without_runtime_fails() {
        let scheduler = TokioBackgroundScheduler::new(Duration::from_millis(50), 200, Arc::new(LogNotifier));
        let err = scheduler.start(Arc::new(|| None), Arc::new(|_| {})).unwrap_err();
        assert!(matches!(err, DetectorError::BackgroundStart(_)));
    }
}
