//! LoRa radio link for LoraLog nodes and gateways

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod driver;
pub mod frame;
pub mod link;
pub mod message;
pub mod qos;
pub mod simulated;
pub mod udp;

pub use driver::{ModemSettings, RadioDriver, RawFrame};
pub use frame::{Header, Packet, BROADCAST_ADDR, HEADER_LEN, MAX_PAYLOAD};
pub use link::{LinkStats, ProbeResult, RadioLink, Reception, Sent};
pub use message::{BroadcastProbe, Message, MessageType, ProbeEcho, WireError};
pub use qos::{QosProfile, DEFAULT_QOS, PRESETS};
pub use simulated::{ChannelConditions, SimulatedRadio, SimulatedRadioNetwork};
pub use udp::{UdpRadio, UdpTransport};

/// Upper bound for every configured wait, in seconds.
pub const MAX_WAIT_SECS: f64 = 86_400.0;

/// Seconds from a config file as a duration, clamped to
/// `0..=MAX_WAIT_SECS`.
pub fn wait_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_WAIT_SECS)).unwrap_or(Duration::ZERO)
}

/// Gateway / base station address.
pub type Address = u8;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("radio hardware not responding: {0}")]
    HardwareMissing(String),

    #[error("packet of {len} bytes exceeds radio MTU of {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("radio transmission failed")]
    TransmissionFailed,

    #[error("no acknowledgement after {attempts} attempts")]
    NoAck { attempts: u8 },

    #[error("invalid frame format")]
    InvalidFrame,

    #[error("invalid radio setting {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("radio io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Delay policy between acknowledgement retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

impl Backoff {
    /// Delay after the failed attempt number `attempt` (0 based).
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed => base,
            Backoff::Exponential => base.saturating_mul(1u32 << attempt.min(8)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub frequency_mhz: f32,
    pub tx_power: i8,
    pub node_addr: Address,
    pub base_addr: Address,
    /// Index into [`PRESETS`].
    pub qos: u8,
    pub spreading_factor: Option<u8>,
    pub coding_rate: Option<u8>,
    pub bandwidth_hz: Option<u32>,
    pub ack_retries: u8,
    pub ack_wait_secs: f64,
    pub ack_delay_secs: f64,
    pub receive_timeout_secs: f64,
    pub backoff: Backoff,
    /// Log every packet at debug level instead of trace.
    pub trace: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: 868.0,
            tx_power: 13,
            node_addr: 0,
            base_addr: 0,
            qos: DEFAULT_QOS,
            spreading_factor: None,
            coding_rate: None,
            bandwidth_hz: None,
            ack_retries: 3,
            ack_wait_secs: 0.5,
            ack_delay_secs: 0.1,
            receive_timeout_secs: 5.0,
            backoff: Backoff::Fixed,
            trace: false,
        }
    }
}

impl RadioConfig {
    /// Preset selected by `qos` with the explicit overrides applied.
    pub fn profile(&self) -> Result<QosProfile, RadioError> {
        let preset = QosProfile::preset(self.qos).ok_or_else(|| RadioError::InvalidConfig {
            field: "qos",
            reason: format!("index {} not in 0..={}", self.qos, PRESETS.len() - 1),
        })?;
        let profile = QosProfile {
            spreading_factor: self.spreading_factor.unwrap_or(preset.spreading_factor),
            coding_rate: self.coding_rate.unwrap_or(preset.coding_rate),
            bandwidth_hz: self.bandwidth_hz.unwrap_or(preset.bandwidth_hz),
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), RadioError> {
        self.profile()?;
        for (field, secs) in [
            ("ack_wait_secs", self.ack_wait_secs),
            ("ack_delay_secs", self.ack_delay_secs),
            ("receive_timeout_secs", self.receive_timeout_secs),
        ] {
            if !(0.0..=MAX_WAIT_SECS).contains(&secs) {
                return Err(RadioError::InvalidConfig {
                    field,
                    reason: format!("{} is not a duration up to {} s", secs, MAX_WAIT_SECS),
                });
            }
        }
        if self.node_addr == BROADCAST_ADDR {
            return Err(RadioError::InvalidConfig {
                field: "node_addr",
                reason: "broadcast address".to_string(),
            });
        }
        Ok(())
    }

    pub fn ack_wait(&self) -> Duration {
        wait_duration(self.ack_wait_secs)
    }

    pub fn ack_delay(&self) -> Duration {
        wait_duration(self.ack_delay_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        wait_duration(self.receive_timeout_secs)
    }
}
