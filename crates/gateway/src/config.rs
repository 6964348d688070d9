use std::path::PathBuf;
use std::time::Duration;

use loralog_core::{ConfigError, ScheduleConfig};
use loralog_radio::{wait_duration, RadioConfig, UdpTransport, MAX_WAIT_SECS};
use serde::{Deserialize, Serialize};

/// Bench settings: stay up for a while after boot and sleep only briefly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevMode {
    pub min_uptime_secs: u64,
    pub sleep_secs: u64,
}

impl Default for DevMode {
    fn default() -> Self {
        Self {
            min_uptime_secs: 300,
            sleep_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamConfig {
    #[default]
    Noop,
    /// Data lines are buffered in `buffer` and handed to the hub at window
    /// end. The host hub writes them to `outbox`.
    Buffered {
        buffer: PathBuf,
        outbox: PathBuf,
        #[serde(default = "default_max_sync_secs")]
        max_sync_secs: u64,
        #[serde(default = "default_poll_secs")]
        poll_secs: u64,
    },
}

fn default_max_sync_secs() -> u64 {
    300
}

fn default_poll_secs() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub radio: RadioConfig,
    pub udp: Option<UdpTransport>,
    /// Start times of the active windows.
    pub schedule: ScheduleConfig,
    /// Length of an active window, 0 keeps the gateway on.
    pub on_duration_secs: u64,
    pub receive_timeout_secs: f64,
    pub dev_mode: Option<DevMode>,
    pub upstream: UpstreamConfig,
    /// Network connectivity may be used for time service requests.
    pub net_update: bool,
    pub time_retries: u8,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            radio: RadioConfig::default(),
            udp: None,
            schedule: ScheduleConfig::default(),
            on_duration_secs: 600,
            receive_timeout_secs: 1.0,
            dev_mode: None,
            upstream: UpstreamConfig::Noop,
            net_update: true,
            time_retries: 3,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule.validate()?;
        self.radio.validate().map_err(|e| ConfigError::Invalid {
            field: "radio",
            reason: e.to_string(),
        })?;
        if self.radio.node_addr != self.radio.base_addr {
            return Err(ConfigError::Invalid {
                field: "radio.node_addr",
                reason: format!(
                    "gateway must listen on the base address {}, not {}",
                    self.radio.base_addr, self.radio.node_addr
                ),
            });
        }
        if !(self.receive_timeout_secs > 0.0 && self.receive_timeout_secs <= MAX_WAIT_SECS) {
            return Err(ConfigError::Invalid {
                field: "receive_timeout_secs",
                reason: format!(
                    "{} is not a positive duration up to {} s",
                    self.receive_timeout_secs, MAX_WAIT_SECS
                ),
            });
        }
        if let UpstreamConfig::Buffered { poll_secs: 0, .. } = self.upstream {
            return Err(ConfigError::Invalid {
                field: "upstream.poll_secs",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn receive_timeout(&self) -> Duration {
        wait_duration(self.receive_timeout_secs)
    }

    /// `None` when the gateway stays on.
    pub fn on_duration(&self) -> Option<Duration> {
        (self.on_duration_secs > 0).then(|| Duration::from_secs(self.on_duration_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: GatewayConfig = serde_json::from_str("{}").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.on_duration(), Some(Duration::from_secs(600)));
        assert_eq!(cfg.receive_timeout(), Duration::from_secs(1));
        assert!(matches!(cfg.upstream, UpstreamConfig::Noop));
    }

    #[test]
    fn test_always_on() {
        let cfg: GatewayConfig = serde_json::from_str(r#"{"on_duration_secs": 0}"#).unwrap();
        assert_eq!(cfg.on_duration(), None);
    }

    #[test]
    fn test_buffered_upstream() {
        let json = r#"{
            "upstream": {"kind": "buffered", "buffer": "buf.csv", "outbox": "out.csv"},
            "dev_mode": {}
        }"#;
        let cfg: GatewayConfig = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();
        match cfg.upstream {
            UpstreamConfig::Buffered {
                max_sync_secs, poll_secs, ..
            } => assert_eq!((max_sync_secs, poll_secs), (300, 1)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cfg.dev_mode.map(|d| d.min_uptime_secs), Some(300));
    }

    #[test]
    fn test_gateway_must_use_base_address() {
        let cfg: GatewayConfig = serde_json::from_str(r#"{"radio": {"node_addr": 4}}"#).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "radio.node_addr", .. })
        ));
    }

    #[test]
    fn test_receive_timeout_bounded() {
        let cfg: GatewayConfig = serde_json::from_str(r#"{"receive_timeout_secs": 1e20}"#).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "receive_timeout_secs", .. })
        ));
        assert_eq!(cfg.receive_timeout(), Duration::from_secs(86_400));
    }
}
