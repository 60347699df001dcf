//! Environmental and motion sensors

use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Where a reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingSource {
    Sensor,
    Simulated,
}

impl ReadingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingSource::Sensor => "sensor",
            ReadingSource::Simulated => "simulated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvReading {
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub source: ReadingSource,
}

pub trait EnvironmentSensor: Send {
    fn read(&mut self) -> Result<EnvReading>;
}

pub trait MotionSensor: Send {
    fn motion_detected(&mut self) -> Result<bool>;
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Temperature on a slow sine around 22°C, humidity falling as it warms.
pub struct SimulatedEnvironment {
    rng: StdRng,
}

impl SimulatedEnvironment {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible noise
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reading for a point in time, in seconds since the epoch
    pub fn reading_at(&mut self, epoch_secs: f64) -> EnvReading {
        let base = 22.0 + 5.0 * (epoch_secs / 3600.0 * 2.0 * PI / 24.0).sin();
        let temperature_c = round1(base + self.rng.gen_range(-2.0..=2.0));
        let humidity = 60.0 - (temperature_c - 20.0) * 2.0 + self.rng.gen_range(-5.0..=5.0);

        EnvReading {
            temperature_c,
            humidity_pct: round1(humidity.clamp(30.0, 90.0)),
            source: ReadingSource::Simulated,
        }
    }
}

impl Default for SimulatedEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentSensor for SimulatedEnvironment {
    fn read(&mut self) -> Result<EnvReading> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Ok(self.reading_at(now))
    }
}

/// Linux IIO humidity/temperature sensor (DHT22 via the `dht11` driver).
///
/// Both attributes are reported in thousandths.
pub struct SysfsEnvironment {
    temperature_path: PathBuf,
    humidity_path: PathBuf,
}

impl SysfsEnvironment {
    pub fn new(iio_dir: &Path) -> Self {
        Self {
            temperature_path: iio_dir.join("in_temp_input"),
            humidity_path: iio_dir.join("in_humidityrelative_input"),
        }
    }

    fn read_milli(path: &Path) -> Result<f64> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Device(format!("{}: {}", path.display(), e)))?;
        let value: i64 = raw
            .trim()
            .parse()
            .map_err(|_| Error::Device(format!("{}: bad value {:?}", path.display(), raw.trim())))?;
        Ok(value as f64 / 1000.0)
    }
}

impl EnvironmentSensor for SysfsEnvironment {
    fn read(&mut self) -> Result<EnvReading> {
        Ok(EnvReading {
            temperature_c: round1(Self::read_milli(&self.temperature_path)?),
            humidity_pct: round1(Self::read_milli(&self.humidity_path)?),
            source: ReadingSource::Sensor,
        })
    }
}

/// PIR that fires at random with a fixed probability per check
pub struct SimulatedMotion {
    probability: f64,
    rng: StdRng,
}

impl SimulatedMotion {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            rng: StdRng::from_entropy(),
        }
    }
}

impl MotionSensor for SimulatedMotion {
    fn motion_detected(&mut self) -> Result<bool> {
        Ok(self.rng.gen_bool(self.probability))
    }
}

/// PIR wired to a sysfs GPIO input
pub struct SysfsMotion {
    value_path: PathBuf,
}

impl SysfsMotion {
    pub fn open(gpio_root: &Path, pin: u32) -> Result<Self> {
        let dir = super::actuators::export_gpio(gpio_root, pin, "in")?;
        Ok(Self {
            value_path: dir.join("value"),
        })
    }
}

impl MotionSensor for SysfsMotion {
    fn motion_detected(&mut self) -> Result<bool> {
        let raw = fs::read_to_string(&self.value_path)
            .map_err(|e| Error::Device(format!("{}: {}", self.value_path.display(), e)))?;
        Ok(raw.trim() == "1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_simulated_reading_bounds() {
        let mut sensor = SimulatedEnvironment::with_seed(7);
        for hour in 0..48 {
            let reading = sensor.reading_at(hour as f64 * 3600.0);
            assert!((15.0..=29.0).contains(&reading.temperature_c));
            assert!((30.0..=90.0).contains(&reading.humidity_pct));
            assert_eq!(reading.source, ReadingSource::Simulated);
        }
    }

    #[test]
    fn test_sysfs_environment() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in_temp_input"), "21460\n").unwrap();
        fs::write(dir.path().join("in_humidityrelative_input"), "48300\n").unwrap();

        let mut sensor = SysfsEnvironment::new(dir.path());
        let reading = sensor.read().unwrap();
        assert_eq!(reading.temperature_c, 21.5);
        assert_eq!(reading.humidity_pct, 48.3);
        assert_eq!(reading.source, ReadingSource::Sensor);
    }

    #[test]
    fn test_sysfs_environment_missing_device() {
        let dir = TempDir::new().unwrap();
        let mut sensor = SysfsEnvironment::new(&dir.path().join("iio:device9"));
        assert!(matches!(sensor.read(), Err(Error::Device(_))));
    }

    #[test]
    fn test_sysfs_motion() {
        let root = TempDir::new().unwrap();
        let gpio = root.path().join("gpio17");
        fs::create_dir(&gpio).unwrap();
        fs::write(gpio.join("value"), "0\n").unwrap();

        let mut pir = SysfsMotion::open(root.path(), 17).unwrap();
        assert!(!pir.motion_detected().unwrap());
        fs::write(gpio.join("value"), "1\n").unwrap();
        assert!(pir.motion_detected().unwrap());
        assert_eq!(fs::read_to_string(gpio.join("direction")).unwrap(), "in");
    }

    #[test]
    fn test_motion_probability_extremes() {
        let mut never = SimulatedMotion::new(0.0);
        let mut always = SimulatedMotion::new(1.0);
        for _ in 0..20 {
            assert!(!never.motion_detected().unwrap());
            assert!(always.motion_detected().unwrap());
        }
    }
}
