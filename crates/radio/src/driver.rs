//! Transceiver seam below the packet link

use std::time::Duration;

use async_trait::async_trait;

use crate::qos::QosProfile;
use crate::RadioError;

/// Register level settings pushed to the transceiver once at startup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModemSettings {
    pub profile: QosProfile,
    pub low_datarate_optimize: bool,
    pub frequency_mhz: f32,
    pub tx_power: i8,
    pub crc: bool,
}

/// A received frame with the link quality measured for it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    pub snr: f32,
    pub rssi: f32,
}

#[async_trait]
pub trait RadioDriver: Send {
    /// Fails when the transceiver does not answer.
    async fn init(&mut self, settings: &ModemSettings) -> Result<(), RadioError>;

    /// Puts one frame on air, giving up after `timeout`.
    async fn send(&mut self, frame: &[u8], timeout: Duration) -> Result<(), RadioError>;

    /// Waits up to `timeout` for a frame. `Ok(None)` when nothing arrived.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<RawFrame>, RadioError>;

    /// Receiver on or off between calls.
    fn set_listening(&mut self, listening: bool);
}
