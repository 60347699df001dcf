//! Core domain types for jeefhs
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | One locally observed fact: a reading, a detection, a state change |
//! | **Sequence number** | Local, strictly increasing id of an event; also the idempotency key in the cloud |
//! | **Synced** | The event has been durably written to the cloud store |
//! | **Device id** | Identity of this edge device in the cloud store |
//!
//! A cloud row is identified by `(device_id, seq)`. Local rows only carry `seq`
//! since one local store belongs to exactly one device.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Local sequence number assigned by the event store.
pub type SequenceNumber = i64;

// ============================================
// Event category
// ============================================

/// What kind of observation an event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Temperature/humidity reading
    Environmental,
    /// Motion detection and related alerts
    Security,
    /// HOME/AWAY/NIGHT transition
    ModeChange,
    /// Actuator switched on or off
    ActuatorState,
    /// Periodic liveness marker
    Heartbeat,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Environmental,
        EventCategory::Security,
        EventCategory::ModeChange,
        EventCategory::ActuatorState,
        EventCategory::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Environmental => "environmental",
            EventCategory::Security => "security",
            EventCategory::ModeChange => "mode_change",
            EventCategory::ActuatorState => "actuator_state",
            EventCategory::Heartbeat => "heartbeat",
        }
    }
}

impl std::str::FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "environmental" => Ok(EventCategory::Environmental),
            "security" => Ok(EventCategory::Security),
            "mode_change" => Ok(EventCategory::ModeChange),
            "actuator_state" => Ok(EventCategory::ActuatorState),
            "heartbeat" => Ok(EventCategory::Heartbeat),
            _ => Err(format!("unknown event category: {}", s)),
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// Payload
// ============================================

/// A single payload value.
///
/// Payloads are flat: no nesting, only scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Scalar::Null)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Bool(v) => write!(f, "{}", v),
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

/// Category-specific event fields, ordered by name so the JSON encoding is canonical.
pub type Payload = BTreeMap<String, Scalar>;

/// Build a [`Payload`] from `key => value` pairs.
///
/// ```
/// use jeefhs_core::payload;
///
/// let p = payload! { "temperature" => 21.5, "source" => "simulated" };
/// assert_eq!(p.len(), 2);
/// ```
#[macro_export]
macro_rules! payload {
    () => { $crate::types::Payload::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut p = $crate::types::Payload::new();
        $( p.insert(($key).to_string(), $crate::types::Scalar::from($value)); )+
        p
    }};
}

// ============================================
// Event record
// ============================================

/// One row of the local event buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Local sequence number (ordering and idempotency key)
    pub seq: SequenceNumber,
    /// What kind of event this is
    pub category: EventCategory,
    /// When the event was observed on the device
    pub captured_at: DateTime<Utc>,
    /// Category-specific fields
    pub payload: Payload,
    /// SHA-256 over category, timestamp and payload
    pub checksum: String,
    /// Whether the event has reached the cloud
    pub synced: bool,
    /// When the synced flag flipped
    pub synced_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    /// True when the stored checksum matches the record contents.
    pub fn verify(&self) -> bool {
        compute_checksum(self.category, &self.captured_at, &self.payload)
            .map(|sum| sum == self.checksum)
            .unwrap_or(false)
    }
}

/// Format a timestamp the way the store persists it.
///
/// Fixed precision and a `Z` suffix keep lexical and chronological order aligned,
/// which the compaction query relies on.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Compute the content checksum of an event (64-char hex).
pub fn compute_checksum(
    category: EventCategory,
    captured_at: &DateTime<Utc>,
    payload: &Payload,
) -> serde_json::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(format_timestamp(captured_at).as_bytes());
    hasher.update(b"|");
    hasher.update(serde_json::to_string(payload)?.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_category_roundtrip() {
        for category in EventCategory::ALL {
            let parsed: EventCategory = category.as_str().parse().unwrap();
            assert_eq!(parsed, category);
        }
        assert!("motion".parse::<EventCategory>().is_err());
    }

    #[test]
    fn test_payload_macro_and_json_shape() {
        let p = payload! {
            "temperature" => 21.5,
            "motion_detected" => true,
            "image_path" => None::<String>,
            "count" => 3i64,
        };
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(
            json,
            r#"{"count":3,"image_path":null,"motion_detected":true,"temperature":21.5}"#
        );

        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("count"), Some(&Scalar::Int(3)));
        assert_eq!(back.get("image_path"), Some(&Scalar::Null));
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let payload = payload! { "temperature" => 22.0 };
        let mut record = EventRecord {
            seq: 1,
            category: EventCategory::Environmental,
            captured_at: ts,
            checksum: compute_checksum(EventCategory::Environmental, &ts, &payload).unwrap(),
            payload,
            synced: false,
            synced_at: None,
        };
        assert!(record.verify());

        record
            .payload
            .insert("temperature".to_string(), Scalar::Float(99.0));
        assert!(!record.verify());
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(format_timestamp(&a), "2025-01-01T00:00:00.000000Z");
    }
}
