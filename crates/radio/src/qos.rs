//! Quality-of-service presets and the timing derived from them

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::HEADER_LEN;
use crate::RadioError;

/// Modulation parameters: spreading factor, coding rate denominator (4/x)
/// and signal bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosProfile {
    pub spreading_factor: u8,
    pub coding_rate: u8,
    pub bandwidth_hz: u32,
}

const fn preset(spreading_factor: u8, coding_rate: u8) -> QosProfile {
    QosProfile {
        spreading_factor,
        coding_rate,
        bandwidth_hz: 125_000,
    }
}

/// Shared by nodes and gateways. Higher indices trade airtime for range.
pub const PRESETS: [QosProfile; 8] = [
    preset(7, 5),
    preset(7, 7),
    preset(8, 7),
    preset(9, 7),
    preset(10, 5),
    preset(11, 5),
    preset(11, 8),
    preset(12, 6),
];

pub const DEFAULT_QOS: u8 = 2;

const BANDWIDTHS: [u32; 10] = [
    7_800, 10_400, 15_600, 20_800, 31_250, 41_700, 62_500, 125_000, 250_000, 500_000,
];

impl QosProfile {
    pub fn preset(index: u8) -> Option<Self> {
        PRESETS.get(index as usize).copied()
    }

    pub fn validate(&self) -> Result<(), RadioError> {
        if !(6..=12).contains(&self.spreading_factor) {
            return Err(RadioError::InvalidConfig {
                field: "spreading_factor",
                reason: format!("{} not in 6..=12", self.spreading_factor),
            });
        }
        if !(5..=8).contains(&self.coding_rate) {
            return Err(RadioError::InvalidConfig {
                field: "coding_rate",
                reason: format!("{} not in 5..=8", self.coding_rate),
            });
        }
        if !BANDWIDTHS.contains(&self.bandwidth_hz) {
            return Err(RadioError::InvalidConfig {
                field: "bandwidth_hz",
                reason: format!("{} Hz not supported", self.bandwidth_hz),
            });
        }
        Ok(())
    }

    /// Application level bytes per second: `sf * 4/cr * bw / 2^sf / 8`.
    pub fn byte_rate(&self) -> f64 {
        let sf = self.spreading_factor as f64;
        sf * 4.0 / self.coding_rate as f64 * self.bandwidth_hz as f64
            / (1u64 << (self.spreading_factor + 3)) as f64
    }

    /// Expected time on air for a payload plus header.
    pub fn airtime(&self, payload_len: usize) -> Duration {
        Duration::from_secs_f64((payload_len + HEADER_LEN) as f64 / self.byte_rate())
    }

    /// Per-call transmit timeout: two seconds of slack on top of the airtime.
    pub fn transmit_timeout(&self, payload_len: usize) -> Duration {
        Duration::from_secs(2) + self.airtime(payload_len)
    }

    pub fn low_datarate_optimize(&self) -> bool {
        let symbol_rate = self.bandwidth_hz as f64 / (1u64 << self.spreading_factor) as f64;
        (self.coding_rate as f64 / 4.0) * 1000.0 / symbol_rate > 16.0
    }
}

impl Default for QosProfile {
    fn default() -> Self {
        PRESETS[DEFAULT_QOS as usize]
    }
}
