//! Host sensors built from configuration

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use loralog_core::{probe_first, Battery, ProbeError, ReadingContext, Sensor, SensorError, VoltageMonitor};
use serde::{Deserialize, Serialize};

const THERMAL_ZONES: [&str; 3] = [
    "/sys/class/thermal/thermal_zone0/temp",
    "/sys/class/thermal/thermal_zone1/temp",
    "/sys/class/hwmon/hwmon0/temp1_input",
];

const POWER_SUPPLIES: [&str; 2] = [
    "/sys/class/power_supply/BAT0/voltage_now",
    "/sys/class/power_supply/BAT1/voltage_now",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorSpec {
    /// The logger id as a column.
    Id,
    /// Fixed voltage, a sysfs file in microvolts, or the first battery found.
    Battery {
        #[serde(default)]
        volts: Option<f32>,
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// Millidegree sysfs file, or the first thermal zone found.
    CpuTemp {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

pub struct IdSensor {
    id: String,
}

impl IdSensor {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Sensor for IdSensor {
    fn name(&self) -> &str {
        "id"
    }

    fn read(&mut self, _ctx: &mut ReadingContext) -> Result<String, SensorError> {
        Ok(self.id.clone())
    }
}

fn read_number(sensor: &str, path: &Path) -> Result<f64, SensorError> {
    let text = fs::read_to_string(path).map_err(|e| SensorError::Read {
        sensor: sensor.to_string(),
        reason: format!("{}: {}", path.display(), e),
    })?;
    text.trim().parse().map_err(|_| SensorError::Read {
        sensor: sensor.to_string(),
        reason: format!("{}: not a number '{}'", path.display(), text.trim()),
    })
}

fn probe_file(candidates: &[PathBuf]) -> Result<PathBuf, ProbeError> {
    probe_first(candidates, |path| {
        if path.is_file() {
            Ok(path.clone())
        } else {
            Err(ProbeError::NotFound {
                device: path.display().to_string(),
            })
        }
    })
}

pub struct ThermalSensor {
    path: PathBuf,
}

impl ThermalSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn probe(candidates: &[PathBuf]) -> Result<Self, ProbeError> {
        probe_file(candidates).map(Self::new)
    }
}

impl Sensor for ThermalSensor {
    fn name(&self) -> &str {
        "cputemp"
    }

    fn read(&mut self, _ctx: &mut ReadingContext) -> Result<String, SensorError> {
        let milli = read_number("cputemp", &self.path)?;
        Ok(format!("{:.1}", milli / 1000.0))
    }
}

pub struct SysfsVoltage {
    path: PathBuf,
}

impl SysfsVoltage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn probe(candidates: &[PathBuf]) -> Result<Self, ProbeError> {
        probe_file(candidates).map(Self::new)
    }
}

impl VoltageMonitor for SysfsVoltage {
    fn volts(&mut self) -> Result<f32, SensorError> {
        Ok((read_number("battery", &self.path)? / 1_000_000.0) as f32)
    }
}

/// A monitor that always reads the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedVoltage(pub f32);

impl VoltageMonitor for FixedVoltage {
    fn volts(&mut self) -> Result<f32, SensorError> {
        Ok(self.0)
    }
}

fn defaults(list: &[&str]) -> Vec<PathBuf> {
    list.iter().map(PathBuf::from).collect()
}

fn build_one(spec: &SensorSpec, logger_id: &str) -> Result<Box<dyn Sensor>, ProbeError> {
    Ok(match spec {
        SensorSpec::Id => Box::new(IdSensor::new(logger_id)),
        SensorSpec::Battery { volts: Some(v), .. } => {
            Box::new(Battery::new(Box::new(FixedVoltage(*v)) as Box<dyn VoltageMonitor>))
        }
        SensorSpec::Battery { volts: None, path } => {
            let candidates = path.clone().map(|p| vec![p]).unwrap_or_else(|| defaults(&POWER_SUPPLIES));
            let monitor = SysfsVoltage::probe(&candidates)?;
            Box::new(Battery::new(Box::new(monitor) as Box<dyn VoltageMonitor>))
        }
        SensorSpec::CpuTemp { path } => {
            let candidates = path.clone().map(|p| vec![p]).unwrap_or_else(|| defaults(&THERMAL_ZONES));
            Box::new(ThermalSensor::probe(&candidates)?)
        }
    })
}

/// Sensors that cannot be found are left out.
pub fn build_sensors(specs: &[SensorSpec], logger_id: &str) -> Vec<Box<dyn Sensor>> {
    specs
        .iter()
        .filter_map(|spec| match build_one(spec, logger_id) {
            Ok(sensor) => {
                info!("configured sensor {}", sensor.name());
                Some(sensor)
            }
            Err(e) => {
                warn!("skipping sensor {:?}: {}", spec, e);
                None
            }
        })
        .collect()
}
