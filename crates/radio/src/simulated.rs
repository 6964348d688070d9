//! Simulated radio network for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;

use crate::driver::{ModemSettings, RadioDriver, RawFrame};
use crate::frame::{HEADER_LEN, MAX_PAYLOAD};
use crate::qos::QosProfile;
use crate::{Address, RadioError};

/// Shared medium characteristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConditions {
    /// Base loss probability, scaled per packet by a bursty factor.
    pub packet_loss: f32,
    pub snr_mean: f32,
    pub snr_std_dev: f32,
    pub rssi_mean: f32,
    pub rssi_std_dev: f32,
    /// Used for airtime only.
    pub profile: QosProfile,
}

impl Default for ChannelConditions {
    fn default() -> Self {
        Self {
            packet_loss: 0.0,
            snr_mean: 7.0,
            snr_std_dev: 1.5,
            rssi_mean: -75.0,
            rssi_std_dev: 4.0,
            profile: QosProfile::default(),
        }
    }
}

fn sample(mean: f32, std_dev: f32) -> f32 {
    Normal::new(mean, std_dev)
        .map(|n| n.sample(&mut rand::rng()))
        .unwrap_or(mean)
}

/// "bursty" packet loss: most packets see less than the base loss, a few
/// see up to three times as much.
fn bursty_loss(base_loss: f32) -> (bool, f64) {
    if base_loss >= 1.0 {
        return (true, 1.0);
    }
    let r: f64 = rand::rng().random();
    let dynamic_factor = if r < 0.7 {
        0.8 + (r / 0.7) * 0.4
    } else if r < 0.95 {
        1.2 + ((r - 0.7) / 0.25) * 0.6
    } else {
        2.0 + ((r - 0.95) / 0.05) * 1.0
    };
    let loss_prob = base_loss as f64 * dynamic_factor;
    (rand::rng().random::<f64>() < loss_prob, loss_prob)
}

struct Port {
    tx: mpsc::Sender<RawFrame>,
    listening: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct NetworkStats {
    packets_sent: u64,
    packets_dropped: u64,
    packets_delivered: u64,
    bytes_sent: u64,
}

/// Every joined radio hears every transmission it is listening for,
/// address filtering happens in the link layer as on real hardware.
pub struct SimulatedRadioNetwork {
    nodes: RwLock<HashMap<Address, Port>>,
    conditions: Mutex<ChannelConditions>,
    stats: Mutex<NetworkStats>,
}

impl SimulatedRadioNetwork {
    pub fn new(conditions: ChannelConditions) -> Arc<Self> {
        log::info!("simulated radio network initialized with {:?}", conditions);
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            conditions: Mutex::new(conditions),
            stats: Mutex::new(NetworkStats::default()),
        })
    }

    pub async fn join(self: &Arc<Self>, addr: Address) -> SimulatedRadio {
        let (tx, rx) = mpsc::channel(64);
        let listening = Arc::new(AtomicBool::new(false));
        self.nodes.write().await.insert(
            addr,
            Port {
                tx,
                listening: Arc::clone(&listening),
            },
        );
        SimulatedRadio {
            addr,
            network: Arc::clone(self),
            rx,
            listening,
            present: true,
        }
    }

    /// A radio whose transceiver never answers.
    pub async fn absent(self: &Arc<Self>, addr: Address) -> SimulatedRadio {
        SimulatedRadio {
            present: false,
            ..self.join(addr).await
        }
    }

    pub async fn set_conditions(&self, conditions: ChannelConditions) {
        *self.conditions.lock().await = conditions;
    }

    async fn transmit(&self, from: Address, frame: &[u8]) {
        let conditions = self.conditions.lock().await.clone();
        let airtime = conditions
            .profile
            .airtime(frame.len().saturating_sub(HEADER_LEN));
        trace!("radio {} on air for {:?} ({} bytes)", from, airtime, frame.len());
        sleep(airtime).await;

        {
            let mut stats = self.stats.lock().await;
            stats.packets_sent += 1;
            stats.bytes_sent += frame.len() as u64;
        }

        let nodes = self.nodes.read().await;
        for (addr, port) in nodes.iter() {
            if *addr == from || !port.listening.load(Ordering::Relaxed) {
                continue;
            }
            let (lost, p) = bursty_loss(conditions.packet_loss);
            if lost {
                self.stats.lock().await.packets_dropped += 1;
                debug!("radio packet {} -> {} dropped (p={:.3})", from, addr, p);
                continue;
            }
            let delivered = RawFrame {
                bytes: frame.to_vec(),
                snr: sample(conditions.snr_mean, conditions.snr_std_dev),
                rssi: sample(conditions.rssi_mean, conditions.rssi_std_dev),
            };
            match port.tx.try_send(delivered) {
                Ok(()) => self.stats.lock().await.packets_delivered += 1,
                Err(e) => log::warn!("radio {} receive buffer full or closed: {}", addr, e),
            }
        }
    }

    /// (sent, dropped, delivered, bytes sent)
    pub async fn get_stats(&self) -> (u64, u64, u64, u64) {
        let stats = self.stats.lock().await;
        (
            stats.packets_sent,
            stats.packets_dropped,
            stats.packets_delivered,
            stats.bytes_sent,
        )
    }
}

pub struct SimulatedRadio {
    addr: Address,
    network: Arc<SimulatedRadioNetwork>,
    rx: mpsc::Receiver<RawFrame>,
    listening: Arc<AtomicBool>,
    present: bool,
}

impl SimulatedRadio {
    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RadioDriver for SimulatedRadio {
    async fn init(&mut self, settings: &ModemSettings) -> Result<(), RadioError> {
        if !self.present {
            return Err(RadioError::HardwareMissing(format!(
                "simulated radio {} is absent",
                self.addr
            )));
        }
        debug!("simulated radio {} configured: {:?}", self.addr, settings);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8], timeout: Duration) -> Result<(), RadioError> {
        if frame.len() > HEADER_LEN + MAX_PAYLOAD {
            return Err(RadioError::PacketTooLarge {
                len: frame.len(),
                max: HEADER_LEN + MAX_PAYLOAD,
            });
        }
        // half duplex
        self.listening.store(false, Ordering::Relaxed);
        tokio::time::timeout(timeout, self.network.transmit(self.addr, frame))
            .await
            .map_err(|_| RadioError::TransmissionFailed)
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<RawFrame>, RadioError> {
        self.listening.store(true, Ordering::Relaxed);
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(RadioError::HardwareMissing(format!(
                "simulated radio {} detached",
                self.addr
            ))),
            Err(_) => Ok(None),
        }
    }

    fn set_listening(&mut self, listening: bool) {
        self.listening.store(listening, Ordering::Relaxed);
    }
}
