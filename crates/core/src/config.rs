use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::schedule::{TimeTable, WakeSchedule, WakeScheduler};

/// Loads a JSON config file into any deserializable settings struct.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Wake scheduling settings shared by nodes and gateways.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Power-off between cycles when true, light or deep sleep otherwise.
    pub strobe_mode: bool,
    /// Used when no time table is configured.
    pub interval_secs: u32,
    pub time_table: Option<TimeTable>,
    pub low_battery_volts: Option<f32>,
    /// Continuous (light sleep) operation stops below this voltage.
    pub continuous_stop_volts: f32,
    pub light_sleep_max_secs: u32,
    /// Restore a cold RTC from the last armed deadline.
    pub save_wakeup: bool,
    /// Allow power-off on a low-battery plan.
    pub acknowledge_low_battery: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            strobe_mode: true,
            interval_secs: 900,
            time_table: None,
            low_battery_volts: Some(3.0),
            continuous_stop_volts: 3.1,
            light_sleep_max_secs: 60,
            save_wakeup: false,
            acknowledge_low_battery: true,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_table.is_none() && self.interval_secs == 0 {
            return Err(ConfigError::Schedule(crate::error::ScheduleError::ZeroInterval));
        }
        if let Some(v) = self.low_battery_volts {
            if !(0.0..=6.0).contains(&v) {
                return Err(ConfigError::Invalid {
                    field: "low_battery_volts",
                    reason: format!("{} V out of range", v),
                });
            }
        }
        Ok(())
    }

    pub fn scheduler(&self) -> Result<WakeScheduler, ConfigError> {
        self.validate()?;
        let schedule = match &self.time_table {
            Some(table) => WakeSchedule::Table(table.clone()),
            None => WakeSchedule::Interval(self.interval_secs),
        };
        Ok(WakeScheduler::new(schedule).with_low_battery_threshold(self.low_battery_volts))
    }
}
