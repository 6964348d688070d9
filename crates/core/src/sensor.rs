//! Sensor seam and battery monitoring

use log::{debug, warn};

use crate::error::{ProbeError, SensorError};
use crate::time::Timestamp;

/// Shared by all sensors of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingContext {
    pub timestamp: Timestamp,
    pub battery: Option<f32>,
}

impl ReadingContext {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            battery: None,
        }
    }
}

pub trait Sensor: Send {
    fn name(&self) -> &str;

    /// Reads once and formats the values as a CSV fragment. Sensors may
    /// update the context, e.g. a battery monitor records its voltage.
    fn read(&mut self, ctx: &mut ReadingContext) -> Result<String, SensorError>;
}

pub trait VoltageMonitor: Send {
    fn volts(&mut self) -> Result<f32, SensorError>;
}

impl<M: VoltageMonitor + ?Sized> VoltageMonitor for Box<M> {
    fn volts(&mut self) -> Result<f32, SensorError> {
        (**self).volts()
    }
}

/// Battery readings outside this window come from a disconnected divider.
const PLAUSIBLE_VOLTS: std::ops::RangeInclusive<f32> = 1.8..=5.5;
const SUBSTITUTE_VOLTS: f32 = 3.5;

pub struct Battery<M> {
    monitor: M,
}

impl<M: VoltageMonitor> Battery<M> {
    pub fn new(monitor: M) -> Self {
        Self { monitor }
    }

    pub fn volts(&mut self) -> Result<f32, SensorError> {
        let raw = self.monitor.volts()?;
        if PLAUSIBLE_VOLTS.contains(&raw) {
            Ok(raw)
        } else {
            warn!("implausible battery reading {:.2}V, using {:.1}V", raw, SUBSTITUTE_VOLTS);
            Ok(SUBSTITUTE_VOLTS)
        }
    }
}

impl<M: VoltageMonitor> Sensor for Battery<M> {
    fn name(&self) -> &str {
        "battery"
    }

    fn read(&mut self, ctx: &mut ReadingContext) -> Result<String, SensorError> {
        let v = self.volts()?;
        ctx.battery = Some(v);
        Ok(format!("{:.2}", v))
    }
}

/// Tries each bus in order and returns the first successful probe.
pub fn probe_first<B, T, F>(buses: impl IntoIterator<Item = B>, mut probe: F) -> Result<T, ProbeError>
where
    F: FnMut(B) -> Result<T, ProbeError>,
{
    let mut last = ProbeError::NoBus;
    for (i, bus) in buses.into_iter().enumerate() {
        match probe(bus) {
            Ok(found) => {
                debug!("device found on bus {}", i);
                return Ok(found);
            }
            Err(e) => last = e,
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(f32);

    impl VoltageMonitor for Fixed {
        fn volts(&mut self) -> Result<f32, SensorError> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_battery_clamp() {
        assert_eq!(Battery::new(Fixed(3.7)).volts().unwrap(), 3.7);
        assert_eq!(Battery::new(Fixed(0.4)).volts().unwrap(), 3.5);
        assert_eq!(Battery::new(Fixed(6.1)).volts().unwrap(), 3.5);
    }

    #[test]
    fn test_battery_records_context() {
        let mut ctx = ReadingContext::new(Timestamp::new(2024, 1, 10, 12, 0, 0));
        let out = Battery::new(Fixed(3.05)).read(&mut ctx).unwrap();
        assert_eq!(out, "3.05");
        assert_eq!(ctx.battery, Some(3.05));
    }

    #[test]
    fn test_probe_first() {
        let found = probe_first([1, 2, 3], |bus| {
            if bus == 2 {
                Ok(bus * 10)
            } else {
                Err(ProbeError::NotFound { device: "sht".into() })
            }
        });
        assert_eq!(found, Ok(20));

        let none: Result<u8, _> = probe_first(Vec::<u8>::new(), |_| Ok(0));
        assert_eq!(none, Err(ProbeError::NoBus));

        let missing: Result<u8, _> = probe_first([1], |_| Err(ProbeError::Bus("nack".into())));
        assert_eq!(missing, Err(ProbeError::Bus("nack".into())));
    }
}
