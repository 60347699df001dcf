//! Party mode: cycle the RGB LEDs until told to stop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::DeviceController;
use crate::error::{Error, Result};

pub const PARTY_LEDS: [&str; 3] = ["red_led", "green_led", "blue_led"];

/// LEDs lit at each step and how long the step lasts, in milliseconds
const SEQUENCE: [(&[&str], u64); 8] = [
    (&["red_led"], 300),
    (&["green_led"], 300),
    (&["blue_led"], 300),
    (&["red_led", "green_led"], 250),
    (&["green_led", "blue_led"], 250),
    (&["red_led", "blue_led"], 250),
    (&["red_led", "green_led", "blue_led"], 500),
    (&[], 200),
];

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    stop: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

/// Owns the LED cycling task. Dropping it stops the cycle.
pub struct PartyMode {
    controller: Arc<DeviceController>,
    running: Mutex<Option<Running>>,
}

impl PartyMode {
    pub fn new(controller: Arc<DeviceController>) -> Self {
        Self {
            controller,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|r| !r.worker.is_finished())
    }

    /// Start cycling. Returns false if already running.
    ///
    /// Refused while any LED is switched on, so a manually set LED is never
    /// overridden. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<bool> {
        let mut running = self.running.lock().unwrap();
        if running.as_ref().is_some_and(|r| !r.worker.is_finished()) {
            return Ok(false);
        }
        if let Some(led) = PARTY_LEDS.iter().find(|led| self.controller.is_on(led)) {
            return Err(Error::InvalidCommand(format!(
                "cannot start party mode while {} is on",
                led
            )));
        }

        let (stop, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(cycle(Arc::clone(&self.controller), stop_rx));
        *running = Some(Running { stop, worker });
        tracing::info!("Party mode started");
        Ok(true)
    }

    /// Stop cycling and wait for the LEDs to go dark. Returns false if not running.
    pub async fn stop(&self) -> bool {
        let running = self.running.lock().unwrap().take();
        let Some(Running { stop, worker }) = running else {
            return false;
        };
        if worker.is_finished() {
            return false;
        }

        let _ = stop.send(());
        if tokio::time::timeout(STOP_TIMEOUT, worker).await.is_err() {
            tracing::warn!("Party mode did not stop in time");
        }
        tracing::info!("Party mode stopped");
        true
    }
}

/// Runs until `stop` fires or its sender is dropped, then switches the LEDs off.
async fn cycle(controller: Arc<DeviceController>, mut stop: oneshot::Receiver<()>) {
    'outer: loop {
        for (lit, millis) in SEQUENCE {
            for led in PARTY_LEDS {
                if let Err(e) = controller.set_device_state(led, lit.contains(&led)) {
                    tracing::warn!(error = %e, device = led, "Party mode LED update failed");
                    break 'outer;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(millis)) => {}
                _ = &mut stop => break 'outer,
            }
        }
    }

    for led in PARTY_LEDS {
        let _ = controller.set_device_state(led, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceSet;

    fn controller() -> Arc<DeviceController> {
        Arc::new(DeviceSet::simulated(Duration::from_millis(100)).controller)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_leds_and_stops_dark() {
        let controller = controller();
        let party = PartyMode::new(Arc::clone(&controller));

        assert!(party.start().unwrap());
        assert!(!party.start().unwrap());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(controller.is_on("red_led"));
        assert!(!controller.is_on("green_led"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(controller.is_on("green_led"));
        assert!(!controller.is_on("red_led"));

        assert!(party.stop().await);
        assert!(!party.is_running());
        assert!(PARTY_LEDS.iter().all(|led| !controller.is_on(led)));
        assert!(!party.stop().await);
    }

    #[tokio::test]
    async fn test_refuses_to_start_over_lit_led() {
        let controller = controller();
        controller.set_device_state("blue_led", true).unwrap();
        let party = PartyMode::new(Arc::clone(&controller));

        assert!(matches!(party.start(), Err(Error::InvalidCommand(_))));
        assert!(!party.is_running());
        assert!(controller.is_on("blue_led"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_switches_leds_off() {
        let controller = controller();
        let party = PartyMode::new(Arc::clone(&controller));
        party.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(controller.is_on("red_led"));

        drop(party);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(PARTY_LEDS.iter().all(|led| !controller.is_on(led)));
    }
}
