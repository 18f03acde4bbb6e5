use chrono::{DateTime, SecondsFormat, Utc};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Which axis group a sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Accel,
    Gyro,
}

/// One accelerometer (G) or gyroscope (deg/s) event.
///
/// Timestamps are monotonic milliseconds. Accelerometer values arrive
/// gravity-normalized, so a phone at rest reads a magnitude of 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub timestamp_ms: u64,
    pub kind: SensorKind,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SensorSample {
    pub fn accel(timestamp_ms: u64, x: f64, y: f64, z: f64) -> Self {
        Self { timestamp_ms, kind: SensorKind::Accel, x, y, z }
    }

    pub fn gyro(timestamp_ms: u64, x: f64, y: f64, z: f64) -> Self {
        Self { timestamp_ms, kind: SensorKind::Gyro, x, y, z }
    }

    pub fn vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn magnitude(&self) -> f64 {
        self.vector().norm()
    }
}

/// Alignment bucket while it still lives in the sliding window.
///
/// An axis group stays `None` until a sample for it lands in the bucket;
/// the gap policy decides what a missing group becomes at evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub timestamp_ms: u64,
    pub accel: Option<Vector3<f64>>,
    pub gyro: Option<Vector3<f64>>,
    pub speed_kmh: f64,
}

impl Frame {
    pub fn new(timestamp_ms: u64, speed_kmh: f64) -> Self {
        Self { timestamp_ms, accel: None, gyro: None, speed_kmh }
    }

    pub fn merge(&mut self, sample: &SensorSample) {
        match sample.kind {
            SensorKind::Accel => self.accel = Some(sample.vector()),
            SensorKind::Gyro => self.gyro = Some(sample.vector()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.accel.is_some() && self.gyro.is_some()
    }
}

/// Frame with both axis groups filled in, ready for feature extraction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusedFrame {
    pub timestamp_ms: u64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
    pub speed_kmh: f64,
}

impl FusedFrame {
    pub fn new(timestamp_ms: u64, accel: Vector3<f64>, gyro: Vector3<f64>, speed_kmh: f64) -> Self {
        Self { timestamp_ms, accel, gyro, speed_kmh }
    }
}

/// Position fix from the location source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed as reported by the platform, meters per second
    pub speed_mps: Option<f64>,
    pub timestamp_ms: u64,
}

impl LocationFix {
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed_mps.map(|s| s * 3.6)
    }
}

/// Live G-force band shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GForceLevel {
    Normal,
    Moderate,
    High,
    Danger,
}

impl GForceLevel {
    pub fn classify(g_force: f64) -> Self {
        if g_force < 2.0 {
            GForceLevel::Normal
        } else if g_force < 5.0 {
            GForceLevel::Moderate
        } else if g_force < 15.0 {
            GForceLevel::High
        } else {
            GForceLevel::Danger
        }
    }
}

/// Raised when a window scores above the alert threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: u64,
    pub triggered_at: DateTime<Utc>,
    pub peak_score: f64,
    pub peak_g_force: f64,
    pub peak_gyro: f64,
    pub location: Option<LocationFix>,
    pub speed_kmh: f64,
    /// JSON document describing the alerting window, forwarded as `sensor_data`
    pub sensor_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyContact {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub relationship: String,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MedicalInfo {
    pub blood_type: String,
    pub allergies: String,
    pub medications: String,
    pub conditions: String,
    pub insurance_info: String,
}

impl MedicalInfo {
    pub fn is_empty(&self) -> bool {
        self.blood_type.is_empty()
            && self.allergies.is_empty()
            && self.medications.is_empty()
            && self.conditions.is_empty()
            && self.insurance_info.is_empty()
    }

    /// Text block surfaced to responders on escalation
    pub fn to_text(&self) -> String {
        let mut text = String::from("MEDICAL INFORMATION\n\n");
        let fields = [
            ("Blood Type", &self.blood_type),
            ("Allergies", &self.allergies),
            ("Medications", &self.medications),
            ("Conditions", &self.conditions),
            ("Insurance", &self.insurance_info),
        ];
        for (label, value) in fields {
            if !value.is_empty() {
                text.push_str(&format!("{}: {}\n", label, value));
            }
        }
        text
    }
}

/// Record posted to the incident reporting sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub lat: String,
    pub lng: String,
    pub timestamp: String,
    pub speed: String,
    pub user_id: String,
    pub acc_peak: String,
    pub gyro_peak: String,
    pub sensor_data: String,
}

impl ReportRecord {
    pub fn from_alert(alert: &AlertEvent, user_id: &str) -> Self {
        let (lat, lng) = alert
            .location
            .map(|l| (l.latitude, l.longitude))
            .unwrap_or((0.0, 0.0));
        Self {
            lat: format!("{:.6}", lat),
            lng: format!("{:.6}", lng),
            timestamp: alert.triggered_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            speed: format!("{:.2}", alert.speed_kmh),
            user_id: user_id.to_string(),
            acc_peak: format!("{}", alert.peak_g_force),
            gyro_peak: format!("{}", alert.peak_gyro),
            sensor_data: alert.sensor_data.clone(),
        }
    }
}

/// Reporting sink acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportReceipt {
    pub incident_id: Option<i64>,
    #[serde(default)]
    pub mobile_report_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sample_magnitude() {
        let accel = SensorSample::accel(0, 3.0, 4.0, 0.0);
        assert_eq!(accel.magnitude(), 5.0);
        assert_eq!(accel.kind, SensorKind::Accel);
    }

    #[test]
    fn test_frame_merge() {
        let mut frame = Frame::new(100, 42.0);
        assert!(!frame.is_complete());

        frame.merge(&SensorSample::accel(101, 0.0, 0.0, 1.0));
        frame.merge(&SensorSample::gyro(110, 5.0, 0.0, 0.0));
        assert!(frame.is_complete());
        assert_eq!(frame.accel, Some(Vector3::new(0.0, 0.0, 1.0)));
        assert_eq!(frame.timestamp_ms, 100);
    }

    #[test]
    fn test_speed_conversion() {
        let fix = LocationFix { latitude: 0.0, longitude: 0.0, speed_mps: Some(10.0), timestamp_ms: 0 };
        assert!((fix.speed_kmh().unwrap() - 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_g_force_levels() {
        assert_eq!(GForceLevel::classify(1.0), GForceLevel::Normal);
        assert_eq!(GForceLevel::classify(2.0), GForceLevel::Moderate);
        assert_eq!(GForceLevel::classify(14.9), GForceLevel::High);
        assert_eq!(GForceLevel::classify(30.0), GForceLevel::Danger);
    }

    #[test]
    fn test_medical_info_text() {
        let info = MedicalInfo {
            blood_type: "O+".to_string(),
            allergies: "penicillin".to_string(),
            ..Default::default()
        };
        let text = info.to_text();
        assert!(text.contains("Blood Type: O+"));
        assert!(text.contains("Allergies: penicillin"));
        assert!(!text.contains("Medications"));
        assert!(MedicalInfo::default().is_empty());
    }

    #[test]
    fn test_medical_info_with_only_conditions_is_not_empty() {
        let conditions = MedicalInfo { conditions: "epilepsy".to_string(), ..Default::default() };
        assert!(!conditions.is_empty());
        let insurance = MedicalInfo { insurance_info: "ACME-123".to_string(), ..Default::default() };
        assert!(!insurance.is_empty());
    }

    #[test]
    fn test_report_record_formatting() {
        let alert = AlertEvent {
            id: 1,
            triggered_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            peak_score: 0.9,
            peak_g_force: 30.5,
            peak_gyro: 450.0,
            location: Some(LocationFix {
                latitude: 12.9715987,
                longitude: 77.5945627,
                speed_mps: Some(11.0),
                timestamp_ms: 0,
            }),
            speed_kmh: 39.6,
            sensor_data: "{}".to_string(),
        };
        let record = ReportRecord::from_alert(&alert, "user-7");
        assert_eq!(record.lat, "12.971599");
        assert_eq!(record.lng, "77.594563");
        assert_eq!(record.timestamp, "2024-05-01T12:30:00.000Z");
        assert_eq!(record.speed, "39.60");
        assert_eq!(record.acc_peak, "30.5");
        assert_eq!(record.user_id, "user-7");
    }
}
