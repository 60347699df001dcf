//! Sensors and actuators
//!
//! Every device is a small trait with two implementations: one backed by the
//! Linux sysfs GPIO/IIO interfaces and one simulated in memory. The backend is
//! chosen once at startup from `[devices] backend`; nothing downstream knows
//! which one it got.

mod actuators;
mod party;
mod sensors;

pub use actuators::{
    Actuator, DeviceController, DeviceStatus, SimulatedActuator, SysfsActuator,
    CONTROLLABLE_DEVICES, REQUIRED_DEVICES,
};
pub use party::{PartyMode, PARTY_LEDS};
pub use sensors::{
    EnvReading, EnvironmentSensor, MotionSensor, ReadingSource, SimulatedEnvironment,
    SimulatedMotion, SysfsEnvironment, SysfsMotion,
};

use std::time::Duration;

use crate::config::{DeviceBackend, DevicesConfig};
use crate::error::Result;

/// Chance per check that the simulated PIR reports motion
const SIMULATED_MOTION_PROBABILITY: f64 = 0.01;

/// The full set of devices the agent drives
pub struct DeviceSet {
    pub environment: Box<dyn EnvironmentSensor>,
    pub motion: Box<dyn MotionSensor>,
    pub controller: DeviceController,
}

impl DeviceSet {
    /// Build devices for `config.backend`, or simulated ones when `simulate` is set.
    pub fn from_config(config: &DevicesConfig, simulate: bool) -> Result<Self> {
        let pulse = Duration::from_millis(config.buzzer_pulse_ms);
        let backend = if simulate {
            DeviceBackend::Simulated
        } else {
            config.backend
        };

        let set = match backend {
            DeviceBackend::Simulated => Self::simulated(pulse),
            DeviceBackend::Sysfs => {
                let mut outputs: Vec<(String, Box<dyn Actuator>)> = Vec::new();
                for name in REQUIRED_DEVICES {
                    let actuator = SysfsActuator::open(&config.gpio_root, config.pin(name)?)?;
                    outputs.push((name.to_string(), Box::new(actuator)));
                }
                Self {
                    environment: Box::new(SysfsEnvironment::new(&config.iio_dir)),
                    motion: Box::new(SysfsMotion::open(
                        &config.gpio_root,
                        config.pin("pir")?,
                    )?),
                    controller: DeviceController::new(outputs, pulse)?,
                }
            }
        };

        tracing::info!(backend = ?backend, "Devices initialized");
        Ok(set)
    }

    /// Entirely in-memory devices
    pub fn simulated(buzzer_pulse: Duration) -> Self {
        let outputs = REQUIRED_DEVICES
            .iter()
            .map(|name| {
                let actuator: Box<dyn Actuator> = Box::new(SimulatedActuator::default());
                (name.to_string(), actuator)
            })
            .collect();

        Self {
            environment: Box::new(SimulatedEnvironment::new()),
            motion: Box::new(SimulatedMotion::new(SIMULATED_MOTION_PROBABILITY)),
            // Simulated outputs never fail to initialize
            controller: DeviceController::from_initialized(outputs, buzzer_pulse),
        }
    }
}
