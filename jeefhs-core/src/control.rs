//! Local control commands
//!
//! One command per line:
//!
//! ```text
//! mode <HOME|AWAY|NIGHT>
//! set <device> <on|off>
//! party <on|off>
//! buzz
//! status
//! ```

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use crate::devices::{DeviceController, PartyMode, CONTROLLABLE_DEVICES};
use crate::error::{Error, Result};
use crate::mode::{Mode, ModeManager};
use crate::recorder::EventRecorder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetMode(Mode),
    SetDevice { device: String, on: bool },
    Party(bool),
    Buzz,
    Status,
}

fn parse_switch(word: &str) -> Result<bool> {
    match word.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        other => Err(Error::InvalidCommand(format!(
            "expected on or off, got '{}'",
            other
        ))),
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [cmd, mode] if cmd.eq_ignore_ascii_case("mode") => Ok(Command::SetMode(mode.parse()?)),
            [cmd, device, state] if cmd.eq_ignore_ascii_case("set") => {
                let device = device.to_ascii_lowercase();
                if !CONTROLLABLE_DEVICES.contains(&device.as_str()) {
                    return Err(Error::InvalidCommand(format!(
                        "unknown device '{}' (expected one of: {})",
                        device,
                        CONTROLLABLE_DEVICES.join(", ")
                    )));
                }
                Ok(Command::SetDevice {
                    device,
                    on: parse_switch(state)?,
                })
            }
            [cmd, state] if cmd.eq_ignore_ascii_case("party") => {
                Ok(Command::Party(parse_switch(state)?))
            }
            [cmd] if cmd.eq_ignore_ascii_case("buzz") => Ok(Command::Buzz),
            [cmd] if cmd.eq_ignore_ascii_case("status") => Ok(Command::Status),
            [] => Err(Error::InvalidCommand("empty command".to_string())),
            _ => Err(Error::InvalidCommand(format!("unrecognized '{}'", line.trim()))),
        }
    }
}

/// Applies commands to the running agent
pub struct Dispatcher {
    modes: Arc<ModeManager>,
    devices: Arc<DeviceController>,
    party: PartyMode,
    recorder: EventRecorder,
}

impl Dispatcher {
    pub fn new(
        modes: Arc<ModeManager>,
        devices: Arc<DeviceController>,
        recorder: EventRecorder,
    ) -> Self {
        Self {
            modes,
            party: PartyMode::new(Arc::clone(&devices)),
            devices,
            recorder,
        }
    }

    /// Run `command` and return a one-line (or, for `status`, multi-line) reply.
    ///
    /// Mode changes are recorded by the mode callbacks, actuator changes here.
    pub async fn dispatch(&self, command: Command) -> Result<String> {
        match command {
            Command::SetMode(mode) => Ok(if self.modes.set_mode(mode) {
                format!("mode {}", mode)
            } else {
                format!("mode already {}", mode)
            }),
            Command::SetDevice { device, on } => {
                if self.devices.set_device_state(&device, on)? {
                    let reply = format!("{} {}", device, if on { "on" } else { "off" });
                    self.recorder
                        .record_async(move |r| r.record_actuator(&device, on))
                        .await?;
                    Ok(reply)
                } else {
                    Ok(format!("{} unchanged", device))
                }
            }
            Command::Party(true) => {
                if self.party.start()? {
                    self.recorder
                        .record_async(|r| r.record_actuator("party_mode", true))
                        .await?;
                    Ok("party on".to_string())
                } else {
                    Ok("party already on".to_string())
                }
            }
            Command::Party(false) => {
                if self.party.stop().await {
                    self.recorder
                        .record_async(|r| r.record_actuator("party_mode", false))
                        .await?;
                    Ok("party off".to_string())
                } else {
                    Ok("party already off".to_string())
                }
            }
            Command::Buzz => {
                self.devices.pulse_buzzer().await?;
                Ok("buzzer pulsed".to_string())
            }
            Command::Status => self.status(),
        }
    }

    fn status(&self) -> Result<String> {
        let stats = self.recorder.store().stats()?;
        let mut out = format!(
            "mode {}\nevents {} ({} unsynced)",
            self.modes.get_mode(),
            stats.total,
            stats.unsynced
        );
        for device in self.devices.status() {
            let _ = write!(out, "\n{} {}", device.name, device.state());
        }
        let _ = write!(
            out,
            "\nparty {}",
            if self.party.is_running() { "on" } else { "off" }
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceSet;
    use crate::store::LocalStore;
    use crate::types::{EventCategory, Scalar};
    use std::time::Duration;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "mode away".parse::<Command>().unwrap(),
            Command::SetMode(Mode::Away)
        );
        assert_eq!(
            "SET Fan On".parse::<Command>().unwrap(),
            Command::SetDevice {
                device: "fan".to_string(),
                on: true
            }
        );
        assert_eq!("party ON".parse::<Command>().unwrap(), Command::Party(true));
        assert_eq!("  buzz ".parse::<Command>().unwrap(), Command::Buzz);
        assert_eq!("status".parse::<Command>().unwrap(), Command::Status);
    }

    #[test]
    fn test_parse_rejects_bad_commands() {
        assert!(matches!(
            "mode vacation".parse::<Command>(),
            Err(Error::InvalidMode(_))
        ));
        for bad in ["", "set buzzer on", "set fan maybe", "reboot", "mode", "party"] {
            assert!(
                matches!(bad.parse::<Command>(), Err(Error::InvalidCommand(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_dispatch_records_actuator_changes() {
        let store = LocalStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        let recorder = EventRecorder::new(Arc::new(store));
        let devices = Arc::new(DeviceSet::simulated(Duration::from_millis(100)).controller);
        let dispatcher = Dispatcher::new(Arc::new(ModeManager::default()), devices, recorder.clone());

        let reply = dispatcher.dispatch("set fan on".parse().unwrap()).await.unwrap();
        assert_eq!(reply, "fan on");
        let reply = dispatcher.dispatch("set fan on".parse().unwrap()).await.unwrap();
        assert_eq!(reply, "fan unchanged");

        let rows = recorder.store().read_unsynced(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category, EventCategory::ActuatorState);

        let status = dispatcher.dispatch(Command::Status).await.unwrap();
        assert!(status.starts_with("mode HOME\nevents 1 (1 unsynced)"));
        assert!(status.contains("fan on"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_party_mode_is_recorded() {
        let store = LocalStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        let recorder = EventRecorder::new(Arc::new(store));
        let devices = Arc::new(DeviceSet::simulated(Duration::from_millis(100)).controller);
        let dispatcher =
            Dispatcher::new(Arc::new(ModeManager::default()), Arc::clone(&devices), recorder.clone());

        assert_eq!(dispatcher.dispatch(Command::Party(true)).await.unwrap(), "party on");
        assert_eq!(dispatcher.dispatch(Command::Party(true)).await.unwrap(), "party already on");
        let status = dispatcher.dispatch(Command::Status).await.unwrap();
        assert!(status.ends_with("party on"));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(dispatcher.dispatch(Command::Party(false)).await.unwrap(), "party off");
        assert_eq!(dispatcher.dispatch(Command::Party(false)).await.unwrap(), "party already off");
        assert!(!devices.is_on("red_led") && !devices.is_on("blue_led"));

        let rows = recorder.store().read_unsynced(10).unwrap();
        let states: Vec<_> = rows.iter().map(|r| r.payload["state"].clone()).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.payload["device"] == Scalar::Text("party_mode".to_string())));
        assert_eq!(
            states,
            vec![Scalar::Text("on".to_string()), Scalar::Text("off".to_string())]
        );
    }
}
