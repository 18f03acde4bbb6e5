//! What happens once an alert exists: the server report and contact texts on
//! entering Alerting, and the call prompt on escalation.
//!
//! Nothing here runs on the sensor path. `dispatch_alert` only spawns.

use chrono::Local;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::collaborators::{
    ContactResolver, MessageSink, Notification, NotificationKind, NotificationSink, ReportingSink,
};
use crate::config::DetectorConfig;
use crate::types::{AlertEvent, EmergencyContact, ReportReceipt, ReportRecord};

const FALLBACK_NAME: &str = "Emergency Services";

/// Who to call once the alert escalates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPrompt {
    pub name: String,
    pub phone: String,
    pub tel_uri: String,
    /// True when no contact was available and the emergency number is used
    pub is_fallback: bool,
}

impl CallPrompt {
    pub fn for_contact(contact: &EmergencyContact) -> Self {
        Self::new(&contact.name, &contact.phone, false)
    }

    pub fn emergency_services(number: &str) -> Self {
        Self::new(FALLBACK_NAME, number, true)
    }

    fn new(name: &str, phone: &str, is_fallback: bool) -> Self {
        let dial: String = phone.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
        Self {
            name: name.to_string(),
            phone: phone.to_string(),
            tel_uri: format!("tel:{}", dial),
            is_fallback,
        }
    }
}

/// Body of the text sent to every emergency contact
pub fn emergency_message(alert: &AlertEvent) -> String {
    let (lat, lng) = alert
        .location
        .map(|l| (l.latitude, l.longitude))
        .unwrap_or((0.0, 0.0));
    let time = alert.triggered_at.with_timezone(&Local).format("%H:%M:%S");

    format!(
        "ACCIDENT DETECTED\n\n\
         Location: https://maps.google.com/?q={lat},{lng}\n\
         Time: {time}\n\
         Speed: {speed:.1} km/h\n\
         Coordinates: {lat:.6}, {lng:.6}\n\n\
         Please check on me immediately!",
        lat = lat,
        lng = lng,
        time = time,
        speed = alert.speed_kmh,
    )
}

#[derive(Debug, Default)]
struct Counters {
    reports_sent: AtomicU64,
    reports_failed: AtomicU64,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    escalations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationStats {
    pub reports_sent: u64,
    pub reports_failed: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub escalations: u64,
}

/// Fans an alert out to the reporting sink, the contacts and the user.
///
/// Cheap to clone; spawned tasks carry their own copy.
#[derive(Clone)]
pub struct EscalationCoordinator {
    reporter: Arc<dyn ReportingSink>,
    messages: Arc<dyn MessageSink>,
    contacts: Arc<dyn ContactResolver>,
    notifier: Arc<dyn NotificationSink>,
    user_id: String,
    emergency_number: String,
    countdown_secs: u32,
    counters: Arc<Counters>,
}

impl EscalationCoordinator {
    pub fn new(
        reporter: Arc<dyn ReportingSink>,
        messages: Arc<dyn MessageSink>,
        contacts: Arc<dyn ContactResolver>,
        notifier: Arc<dyn NotificationSink>,
        config: &DetectorConfig,
    ) -> Self {
        Self {
            reporter,
            messages,
            contacts,
            notifier,
            user_id: config.user_id.clone(),
            emergency_number: config.emergency_number.clone(),
            countdown_secs: config.countdown_secs,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn contacts(&self) -> &Arc<dyn ContactResolver> {
        &self.contacts
    }

    pub fn notify(&self, notification: Notification) {
        self.notifier.notify(&notification);
    }

    /// Alert the user, then fire the report and the contact texts as
    /// independent tasks. Returns immediately.
    pub fn dispatch_alert(&self, runtime: &Handle, alert: &AlertEvent) -> Vec<JoinHandle<()>> {
        self.notify(Notification::new(
            NotificationKind::Alert,
            "Accident detected",
            format!(
                "Are you OK? Emergency contacts will be called in {} seconds unless you respond.",
                self.countdown_secs
            ),
        ));

        let reporter = self.clone();
        let report_alert = alert.clone();
        let report = runtime.spawn(async move {
            reporter.report(&report_alert).await;
        });

        let messenger = self.clone();
        let sms_alert = alert.clone();
        let texts = runtime.spawn(async move {
            messenger.notify_contacts(&sms_alert).await;
        });

        vec![report, texts]
    }

    /// Send the incident report. Failure is logged and counted, nothing else.
    pub async fn report(&self, alert: &AlertEvent) -> Option<ReportReceipt> {
        let record = ReportRecord::from_alert(alert, &self.user_id);
        match self.reporter.report(&record).await {
            Ok(receipt) => {
                self.counters.reports_sent.fetch_add(1, Ordering::Relaxed);
                info!(
                    "[REPORT] Alert #{} reported, incident {:?}",
                    alert.id, receipt.incident_id
                );
                Some(receipt)
            }
            Err(e) => {
                self.counters.reports_failed.fetch_add(1, Ordering::Relaxed);
                error!("[REPORT] Alert #{} report failed: {}", alert.id, e);
                None
            }
        }
    }

    /// Text every emergency contact. Returns how many sends succeeded.
    pub async fn notify_contacts(&self, alert: &AlertEvent) -> usize {
        let contacts = match self.contacts.emergency_contacts().await {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!("[ESCALATE] Could not load contacts: {}", e);
                return 0;
            }
        };
        if contacts.is_empty() {
            warn!("[ESCALATE] No emergency contacts to notify");
            return 0;
        }

        let body = emergency_message(alert);
        let mut sent = 0;
        for contact in &contacts {
            match self.messages.send_sms(&contact.phone, &body).await {
                Ok(()) => {
                    sent += 1;
                    self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.messages_failed.fetch_add(1, Ordering::Relaxed);
                    warn!("[ESCALATE] SMS to {} failed: {}", contact.name, e);
                }
            }
        }

        self.notify(Notification::status(
            "Emergency contacts",
            format!("Notified {} emergency contacts", sent),
        ));
        sent
    }

    /// Resolve who to call and surface the prompt, plus medical info if any
    pub async fn escalate(&self, alert: &AlertEvent) -> CallPrompt {
        self.counters.escalations.fetch_add(1, Ordering::Relaxed);

        let prompt = match self.contacts.primary_contact().await {
            Ok(Some(contact)) => CallPrompt::for_contact(&contact),
            Ok(None) => CallPrompt::emergency_services(&self.emergency_number),
            Err(e) => {
                warn!("[ESCALATE] Primary contact lookup failed: {}", e);
                CallPrompt::emergency_services(&self.emergency_number)
            }
        };

        warn!("[ESCALATE] Alert #{} escalated, calling {} ({})", alert.id, prompt.name, prompt.phone);
        self.notify(Notification::new(
            NotificationKind::CallPrompt,
            format!("Call {}", prompt.name),
            prompt.tel_uri.clone(),
        ));

        match self.contacts.medical_info().await {
            Ok(Some(medical)) if !medical.is_empty() => {
                self.notify(Notification::new(NotificationKind::Medical, "Medical information", medical.to_text()));
            }
            Ok(_) => {}
            Err(e) => warn!("[ESCALATE] Medical info unavailable: {}", e),
        }

        prompt
    }

    pub fn stats(&self) -> EscalationStats {
        EscalationStats {
            reports_sent: self.counters.reports_sent.load(Ordering::Relaxed),
            reports_failed: self.counters.reports_failed.load(Ordering::Relaxed),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.counters.messages_failed.load(Ordering::Relaxed),
            escalations: self.counters.escalations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        alert_event, contact, FailingReporter, RecordingMessages, RecordingNotifier, RecordingReporter,
        StaticContacts,
    };
    use crate::types::{LocationFix, MedicalInfo};

    struct Fixture {
        reporter: Arc<RecordingReporter>,
        messages: Arc<RecordingMessages>,
        notifier: Arc<RecordingNotifier>,
        coordinator: EscalationCoordinator,
    }

    fn fixture(contacts: StaticContacts) -> Fixture {
        let reporter = Arc::new(RecordingReporter::default());
        let messages = Arc::new(RecordingMessages::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = EscalationCoordinator::new(
            reporter.clone(),
            messages.clone(),
            Arc::new(contacts),
            notifier.clone(),
            &DetectorConfig::default(),
        );
        Fixture { reporter, messages, notifier, coordinator }
    }

    #[test]
    fn test_emergency_message_format() {
        let mut alert = alert_event();
        alert.speed_kmh = 42.26;
        alert.location = Some(LocationFix {
            latitude: 12.9715987,
            longitude: 77.594566,
            speed_mps: None,
            timestamp_ms: 0,
        });

        let body = emergency_message(&alert);
        assert!(body.starts_with("ACCIDENT DETECTED"));
        assert!(body.contains("https://maps.google.com/?q=12.9715987,77.594566"));
        assert!(body.contains("Speed: 42.3 km/h"));
        assert!(body.contains("Coordinates: 12.971599, 77.594566"));
    }

    #[test]
    fn test_call_prompt_uri() {
        let prompt = CallPrompt::for_contact(&contact("Ann", "+1 (555) 010-0", true));
        assert_eq!(prompt.tel_uri, "tel:+15550100");
        assert!(!prompt.is_fallback);

        let fallback = CallPrompt::emergency_services("108");
        assert_eq!(fallback.name, "Emergency Services");
        assert_eq!(fallback.tel_uri, "tel:108");
    }

    #[tokio::test]
    async fn test_sms_fan_out_counts_successes() {
        let f = fixture(StaticContacts::new(vec![
            contact("Ann", "+15550101", false),
            contact("Bob", "", false),
            contact("Cy", "+15550103", true),
        ]));

        let sent = f.coordinator.notify_contacts(&alert_event()).await;
        assert_eq!(sent, 2);
        assert_eq!(f.messages.recipients(), vec!["+15550101", "+15550103"]);
        assert!(f.notifier.bodies().contains(&"Notified 2 emergency contacts".to_string()));

        let stats = f.coordinator.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_failed, 1);
    }

    #[tokio::test]
    async fn test_report_failure_is_swallowed() {
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = EscalationCoordinator::new(
            Arc::new(FailingReporter),
            Arc::new(RecordingMessages::default()),
            Arc::new(StaticContacts::new(vec![])),
            notifier,
            &DetectorConfig::default(),
        );

        assert!(coordinator.report(&alert_event()).await.is_none());
        assert_eq!(coordinator.stats().reports_failed, 1);
    }

    #[tokio::test]
    async fn test_report_carries_alert_fields() {
        let f = fixture(StaticContacts::new(vec![]));
        let receipt = f.coordinator.report(&alert_event()).await.unwrap();
        assert_eq!(receipt.incident_id, Some(1));

        let records = f.reporter.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id, "anonymous");
        assert_eq!(records[0].acc_peak, "30");
    }

    #[tokio::test]
    async fn test_escalate_falls_back_to_emergency_number() {
        let f = fixture(StaticContacts::new(vec![]));
        let prompt = f.coordinator.escalate(&alert_event()).await;
        assert_eq!(prompt, CallPrompt::emergency_services("108"));
        assert_eq!(f.coordinator.stats().escalations, 1);
    }

    #[tokio::test]
    async fn test_escalate_surfaces_medical_info() {
        let medical = MedicalInfo { blood_type: "AB-".to_string(), ..Default::default() };
        let f = fixture(
            StaticContacts::new(vec![contact("Ann", "+15550101", false), contact("Bob", "+15550102", true)])
                .with_medical(medical),
        );

        let prompt = f.coordinator.escalate(&alert_event()).await;
        assert_eq!(prompt.name, "Bob");

        let kinds: Vec<NotificationKind> = f.notifier.notifications().iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::CallPrompt, NotificationKind::Medical]);
        assert!(f.notifier.bodies()[1].contains("Blood Type: AB-"));
    }

    #[tokio::test]
    async fn test_escalate_surfaces_conditions_only_medical_info() {
        let medical = MedicalInfo { conditions: "epilepsy".to_string(), ..Default::default() };
        let f = fixture(StaticContacts::new(vec![contact("Ann", "+15550101", true)]).with_medical(medical));

        f.coordinator.escalate(&alert_event()).await;

        let kinds: Vec<NotificationKind> = f.notifier.notifications().iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::CallPrompt, NotificationKind::Medical]);
        assert!(f.notifier.bodies()[1].contains("Conditions: epilepsy"));
    }

    #[tokio::test]
    async fn test_dispatch_runs_report_and_texts() {
        let f = fixture(StaticContacts::new(vec![contact("Ann", "+15550101", true)]));
        let handles = f.coordinator.dispatch_alert(&Handle::current(), &alert_event());
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(f.reporter.records().len(), 1);
        assert_eq!(f.messages.recipients(), vec!["+15550101"]);
        assert_eq!(f.notifier.notifications()[0].kind, NotificationKind::Alert);
    }
}
