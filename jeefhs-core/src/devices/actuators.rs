//! LEDs, fan relay and buzzer

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

/// Outputs the agent drives; all must have a pin on real hardware
pub const REQUIRED_DEVICES: [&str; 5] = ["red_led", "green_led", "blue_led", "fan", "buzzer"];

/// Outputs that may be switched by command. The buzzer only pulses.
pub const CONTROLLABLE_DEVICES: [&str; 4] = ["red_led", "green_led", "blue_led", "fan"];

/// Shortest buzzer pulse that is still audible
const MIN_PULSE: Duration = Duration::from_millis(100);

pub trait Actuator: Send {
    fn set(&mut self, on: bool) -> Result<()>;
}

/// Output that only remembers its value
#[derive(Debug, Default)]
pub struct SimulatedActuator {
    on: bool,
}

impl SimulatedActuator {
    pub fn is_on(&self) -> bool {
        self.on
    }
}

impl Actuator for SimulatedActuator {
    fn set(&mut self, on: bool) -> Result<()> {
        self.on = on;
        Ok(())
    }
}

/// Export `pin` if needed and set its direction. Returns the pin's directory.
pub(crate) fn export_gpio(gpio_root: &Path, pin: u32, direction: &str) -> Result<PathBuf> {
    let dir = gpio_root.join(format!("gpio{}", pin));
    if !dir.exists() {
        fs::write(gpio_root.join("export"), pin.to_string())
            .map_err(|e| Error::Device(format!("failed to export GPIO {}: {}", pin, e)))?;
    }
    fs::write(dir.join("direction"), direction)
        .map_err(|e| Error::Device(format!("failed to configure GPIO {}: {}", pin, e)))?;
    Ok(dir)
}

/// Output on a sysfs GPIO line
pub struct SysfsActuator {
    value_path: PathBuf,
}

impl SysfsActuator {
    pub fn open(gpio_root: &Path, pin: u32) -> Result<Self> {
        let dir = export_gpio(gpio_root, pin, "out")?;
        Ok(Self {
            value_path: dir.join("value"),
        })
    }
}

impl Actuator for SysfsActuator {
    fn set(&mut self, on: bool) -> Result<()> {
        fs::write(&self.value_path, if on { "1" } else { "0" })
            .map_err(|e| Error::Device(format!("{}: {}", self.value_path.display(), e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub name: String,
    pub on: bool,
}

impl DeviceStatus {
    pub fn state(&self) -> &'static str {
        if self.on {
            "on"
        } else {
            "off"
        }
    }
}

struct Output {
    actuator: Box<dyn Actuator>,
    on: bool,
}

/// Tracks and switches every output. Safe to share between tasks.
pub struct DeviceController {
    outputs: Mutex<BTreeMap<String, Output>>,
    buzzer_pulse: Duration,
}

impl DeviceController {
    /// Take ownership of `outputs` and switch them all off.
    pub fn new(outputs: Vec<(String, Box<dyn Actuator>)>, buzzer_pulse: Duration) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (name, mut actuator) in outputs {
            actuator.set(false)?;
            map.insert(name, Output { actuator, on: false });
        }
        Ok(Self {
            outputs: Mutex::new(map),
            buzzer_pulse,
        })
    }

    pub(crate) fn from_initialized(
        outputs: Vec<(String, Box<dyn Actuator>)>,
        buzzer_pulse: Duration,
    ) -> Self {
        let map = outputs
            .into_iter()
            .map(|(name, actuator)| (name, Output { actuator, on: false }))
            .collect();
        Self {
            outputs: Mutex::new(map),
            buzzer_pulse,
        }
    }

    /// Switch a controllable device. Returns true if its state changed.
    ///
    /// Unknown devices and the buzzer are ignored.
    pub fn set_device_state(&self, name: &str, on: bool) -> Result<bool> {
        let name = name.to_ascii_lowercase();
        if !CONTROLLABLE_DEVICES.contains(&name.as_str()) {
            tracing::debug!(device = %name, "Ignoring toggle for unsupported device");
            return Ok(false);
        }

        let mut outputs = self.outputs.lock().unwrap();
        let Some(output) = outputs.get_mut(&name) else {
            tracing::warn!(device = %name, "Device not initialized");
            return Ok(false);
        };
        if output.on == on {
            return Ok(false);
        }

        output.actuator.set(on)?;
        output.on = on;
        if name.ends_with("_led") {
            tracing::debug!(device = %name, on, "Set device state");
        } else {
            tracing::info!(device = %name, on, "Set device state");
        }
        Ok(true)
    }

    /// Sound the buzzer for the configured pulse length.
    ///
    /// The lock is not held while waiting, so other outputs stay switchable.
    pub async fn pulse_buzzer(&self) -> Result<()> {
        if !self.switch_buzzer(true)? {
            tracing::warn!("Buzzer not configured; pulse ignored");
            return Ok(());
        }
        tracing::info!(duration_ms = self.buzzer_pulse.as_millis() as u64, "Pulsing buzzer");
        tokio::time::sleep(self.buzzer_pulse.max(MIN_PULSE)).await;
        self.switch_buzzer(false)?;
        Ok(())
    }

    fn switch_buzzer(&self, on: bool) -> Result<bool> {
        let mut outputs = self.outputs.lock().unwrap();
        match outputs.get_mut("buzzer") {
            Some(buzzer) => {
                buzzer.actuator.set(on)?;
                buzzer.on = on;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Latest known state of every output, ordered by name
    pub fn status(&self) -> Vec<DeviceStatus> {
        self.outputs
            .lock()
            .unwrap()
            .iter()
            .map(|(name, output)| DeviceStatus {
                name: name.clone(),
                on: output.on,
            })
            .collect()
    }

    pub fn is_on(&self, name: &str) -> bool {
        self.outputs
            .lock()
            .unwrap()
            .get(name)
            .map(|o| o.on)
            .unwrap_or(false)
    }
}
