//! simulation tools for LoraLog

pub mod scenarios;

use loralog_radio::{ChannelConditions, PRESETS};

pub struct SimulationPresets;

impl SimulationPresets {
    /// Line of sight, a few hundred metres.
    pub fn good_conditions() -> ChannelConditions {
        ChannelConditions {
            packet_loss: 0.02,
            snr_mean: 9.0,
            snr_std_dev: 1.0,
            rssi_mean: -70.0,
            rssi_std_dev: 3.0,
            profile: PRESETS[2],
        }
    }

    pub fn average_conditions() -> ChannelConditions {
        ChannelConditions {
            packet_loss: 0.10,
            snr_mean: 2.0,
            snr_std_dev: 2.5,
            rssi_mean: -98.0,
            rssi_std_dev: 5.0,
            profile: PRESETS[4],
        }
    }

    pub fn poor_conditions() -> ChannelConditions {
        ChannelConditions {
            packet_loss: 0.25,
            snr_mean: -6.0,
            snr_std_dev: 3.0,
            rssi_mean: -112.0,
            rssi_std_dev: 6.0,
            profile: PRESETS[5],
        }
    }

    /// Deep indoor or far beyond the horizon, slowest preset.
    pub fn extreme_conditions() -> ChannelConditions {
        ChannelConditions {
            packet_loss: 0.50,
            snr_mean: -14.0,
            snr_std_dev: 4.0,
            rssi_mean: -124.0,
            rssi_std_dev: 6.0,
            profile: PRESETS[7],
        }
    }
}
