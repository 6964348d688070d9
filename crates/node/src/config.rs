use std::path::PathBuf;

use loralog_core::{ConfigError, ScheduleConfig};
use loralog_radio::{RadioConfig, UdpTransport};
use serde::{Deserialize, Serialize};

use crate::sensors::SensorSpec;

/// How a measurement is handed to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitPolicy {
    Off,
    #[default]
    BestEffort,
    Acknowledged,
}

/// Link test mode: repeated broadcast probes instead of measurements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub count: u32,
    pub interval_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            count: 10,
            interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub logger_id: String,
    /// `None` runs without a radio.
    pub radio: Option<RadioConfig>,
    pub udp: Option<UdpTransport>,
    pub schedule: ScheduleConfig,
    pub transmit: TransmitPolicy,
    /// Ask the gateway for the time when the local clock chain fails.
    pub query_gateway_time: bool,
    pub time_query_retries: u8,
    /// Network connectivity may be used for time service requests.
    pub net_update: bool,
    pub time_url: Option<String>,
    /// Record file template, `None` disables local storage.
    pub csv_template: Option<String>,
    pub data_dir: PathBuf,
    pub nv_path: PathBuf,
    pub sensors: Vec<SensorSpec>,
    pub probe: Option<ProbeConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            logger_id: "node".to_string(),
            radio: None,
            udp: None,
            schedule: ScheduleConfig::default(),
            transmit: TransmitPolicy::BestEffort,
            query_gateway_time: true,
            time_query_retries: 3,
            net_update: true,
            time_url: None,
            csv_template: Some("log_{ID}_{YMD}.csv".to_string()),
            data_dir: PathBuf::from("data"),
            nv_path: PathBuf::from("data/nvstate.bin"),
            sensors: vec![SensorSpec::Id],
            probe: None,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule.validate()?;
        if self.logger_id.is_empty() || self.logger_id.contains(',') {
            return Err(ConfigError::Invalid {
                field: "logger_id",
                reason: format!("'{}' must be non-empty and free of commas", self.logger_id),
            });
        }
        if let Some(radio) = &self.radio {
            radio.validate().map_err(|e| ConfigError::Invalid {
                field: "radio",
                reason: e.to_string(),
            })?;
            if radio.node_addr == radio.base_addr {
                return Err(ConfigError::Invalid {
                    field: "radio.node_addr",
                    reason: format!("{} is the gateway address", radio.node_addr),
                });
            }
        }
        if let Some(probe) = &self.probe {
            if self.radio.is_none() {
                return Err(ConfigError::Invalid {
                    field: "probe",
                    reason: "needs a radio".to_string(),
                });
            }
            if probe.count == 0 {
                return Err(ConfigError::Invalid {
                    field: "probe.count",
                    reason: "must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.transmit, TransmitPolicy::BestEffort);
        assert_eq!(cfg.time_query_retries, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_node_cannot_use_gateway_address() {
        let cfg: NodeConfig = serde_json::from_str(r#"{"radio": {"node_addr": 0}}"#).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "radio.node_addr", .. })
        ));
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "logger_id": "lg7",
            "radio": {"node_addr": 7, "qos": 4, "ack_retries": 5},
            "transmit": "acknowledged",
            "schedule": {"strobe_mode": false, "time_table": [
                [[7,17,1],[0,59,15]], [[7,17,1],[0,59,15]], [[7,17,1],[0,59,15]],
                [[7,17,1],[0,59,15]], [[7,17,1],[0,59,15]], null, null]},
            "sensors": [{"kind": "id"}, {"kind": "battery", "volts": 3.9}]
        }"#;
        let cfg: NodeConfig = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.transmit, TransmitPolicy::Acknowledged);
        assert_eq!(cfg.radio.as_ref().map(|r| r.ack_retries), Some(5));
        assert_eq!(cfg.sensors.len(), 2);
    }

    #[test]
    fn test_probe_needs_radio() {
        let cfg: NodeConfig = serde_json::from_str(r#"{"probe": {"count": 3}}"#).unwrap();
        assert!(cfg.validate().is_err());
    }
}
