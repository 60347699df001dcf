//! Event producer for the agent
//!
//! Turns readings, detections and state changes into [`LocalStore`] appends.
//! Every method returns the assigned sequence number; an error means the
//! event was not recorded and the caller should treat it as fatal.

use std::sync::Arc;

use chrono::Utc;

use crate::devices::EnvReading;
use crate::error::Result;
use crate::mode::Mode;
use crate::payload;
use crate::store::{self, LocalStore};
use crate::types::{EventCategory, SequenceNumber};

#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<LocalStore>,
}

impl EventRecorder {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Run one of the `record_*` calls on the blocking pool.
    ///
    /// Async producers use this; the synchronous methods stay available for
    /// callers already off the runtime, such as mode callbacks.
    pub async fn record_async<F>(&self, record: F) -> Result<SequenceNumber>
    where
        F: FnOnce(&EventRecorder) -> Result<SequenceNumber> + Send + 'static,
    {
        let recorder = self.clone();
        store::blocking(move || record(&recorder)).await
    }

    pub fn record_environment(&self, reading: &EnvReading) -> Result<SequenceNumber> {
        self.store.append(
            EventCategory::Environmental,
            Utc::now(),
            &payload! {
                "temperature" => reading.temperature_c,
                "humidity" => reading.humidity_pct,
                "source" => reading.source.as_str(),
            },
        )
    }

    pub fn record_motion(&self, mode: Mode, buzzer_triggered: bool) -> Result<SequenceNumber> {
        self.store.append(
            EventCategory::Security,
            Utc::now(),
            &payload! {
                "motion_detected" => true,
                "mode" => mode.as_str(),
                "buzzer_triggered" => buzzer_triggered,
                // No camera on this build
                "image_path" => None::<String>,
            },
        )
    }

    pub fn record_mode_change(&self, mode: Mode) -> Result<SequenceNumber> {
        self.store.append(
            EventCategory::ModeChange,
            Utc::now(),
            &payload! { "mode" => mode.as_str() },
        )
    }

    pub fn record_actuator(&self, device: &str, on: bool) -> Result<SequenceNumber> {
        self.store.append(
            EventCategory::ActuatorState,
            Utc::now(),
            &payload! {
                "device" => device,
                "state" => if on { "on" } else { "off" },
            },
        )
    }

    /// Liveness marker carrying the agent's uptime and current mode
    pub fn heartbeat(&self, uptime_secs: u64, mode: Mode) -> Result<SequenceNumber> {
        self.store.append(
            EventCategory::Heartbeat,
            Utc::now(),
            &payload! {
                "uptime_secs" => uptime_secs as i64,
                "mode" => mode.as_str(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ReadingSource;
    use crate::types::Scalar;

    fn recorder() -> EventRecorder {
        let store = LocalStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        EventRecorder::new(Arc::new(store))
    }

    #[test]
    fn test_records_land_in_order_with_categories() {
        let recorder = recorder();
        let reading = EnvReading {
            temperature_c: 21.5,
            humidity_pct: 48.0,
            source: ReadingSource::Sensor,
        };

        let a = recorder.record_environment(&reading).unwrap();
        let b = recorder.record_mode_change(Mode::Away).unwrap();
        let c = recorder.record_motion(Mode::Away, true).unwrap();
        let d = recorder.record_actuator("fan", true).unwrap();
        let e = recorder.heartbeat(30, Mode::Away).unwrap();
        assert!(a < b && b < c && c < d && d < e);

        let rows = recorder.store().read_unsynced(10).unwrap();
        let categories: Vec<_> = rows.iter().map(|r| r.category).collect();
        assert_eq!(
            categories,
            vec![
                EventCategory::Environmental,
                EventCategory::ModeChange,
                EventCategory::Security,
                EventCategory::ActuatorState,
                EventCategory::Heartbeat,
            ]
        );
        assert_eq!(rows[0].payload["temperature"], Scalar::Float(21.5));
        assert_eq!(rows[2].payload["buzzer_triggered"], Scalar::Bool(true));
        assert_eq!(rows[2].payload["image_path"], Scalar::Null);
        assert_eq!(rows[3].payload["state"], Scalar::Text("on".to_string()));
    }

    #[tokio::test]
    async fn test_record_async_appends() {
        let recorder = recorder();
        let seq = recorder
            .record_async(|r| r.record_motion(Mode::Night, false))
            .await
            .unwrap();

        let record = recorder.store().get(seq).unwrap().unwrap();
        assert_eq!(record.category, EventCategory::Security);
        assert_eq!(record.payload["mode"], Scalar::Text("NIGHT".to_string()));
    }
}
