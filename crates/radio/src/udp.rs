//! Radio frames over UDP datagrams, for running nodes and gateways on hosts

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::driver::{ModemSettings, RadioDriver, RawFrame};
use crate::frame::{HEADER_LEN, MAX_PAYLOAD};
use crate::RadioError;

/// Host transport settings standing in for the LoRa transceiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpTransport {
    pub bind: SocketAddr,
    pub peers: Vec<SocketAddr>,
}

/// Every frame is sent to all peers. Link quality is not measured, received
/// frames report an SNR and RSSI of zero.
pub struct UdpRadio {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
}

impl UdpRadio {
    pub async fn bind(local: SocketAddr, peers: Vec<SocketAddr>) -> Result<Self, RadioError> {
        let socket = UdpSocket::bind(local).await?;
        debug!("udp radio bound to {}", socket.local_addr()?);
        Ok(Self {
            socket,
            peers,
        })
    }

    pub async fn from_transport(transport: &UdpTransport) -> Result<Self, RadioError> {
        Self::bind(transport.bind, transport.peers.clone()).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RadioError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn add_peer(&mut self, peer: SocketAddr) {
        self.peers.push(peer);
    }
}

#[async_trait]
impl RadioDriver for UdpRadio {
    async fn init(&mut self, settings: &ModemSettings) -> Result<(), RadioError> {
        if self.peers.is_empty() {
            return Err(RadioError::HardwareMissing("udp radio has no peers".to_string()));
        }
        debug!("udp radio configured: {:?}, peers {:?}", settings, self.peers);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8], limit: Duration) -> Result<(), RadioError> {
        if frame.len() > HEADER_LEN + MAX_PAYLOAD {
            return Err(RadioError::PacketTooLarge {
                len: frame.len(),
                max: HEADER_LEN + MAX_PAYLOAD,
            });
        }
        for peer in &self.peers {
            timeout(limit, self.socket.send_to(frame, peer))
                .await
                .map_err(|_| RadioError::TransmissionFailed)??;
            trace!("udp radio sent {} bytes to {}", frame.len(), peer);
        }
        Ok(())
    }

    async fn receive(&mut self, limit: Duration) -> Result<Option<RawFrame>, RadioError> {
        let mut buf = [0u8; HEADER_LEN + MAX_PAYLOAD];
        match timeout(limit, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                trace!("udp radio received {} bytes from {}", len, from);
                Ok(Some(RawFrame {
                    bytes: buf[..len].to_vec(),
                    snr: 0.0,
                    rssi: 0.0,
                }))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    /// Datagrams queue in the socket regardless.
    fn set_listening(&mut self, _listening: bool) {}
}
