//! Addressed packet link with acknowledgement, probing and time queries

use std::collections::HashMap;
use std::time::Duration;

use log::{error, info, log, trace, warn, Level};
use loralog_core::Timestamp;
use rand::Rng;
use tokio::time::{sleep, Instant};

use crate::driver::{ModemSettings, RadioDriver};
use crate::frame::{Header, Packet, BROADCAST_ADDR, FLAG_RETRY};
use crate::message::{decode_time_reply, BroadcastProbe, Message, MessageType, ProbeEcho};
use crate::qos::QosProfile;
use crate::{Address, RadioConfig, RadioError};

/// A packet delivered to this node.
#[derive(Debug, Clone, PartialEq)]
pub struct Reception {
    pub payload: Vec<u8>,
    pub sender: Address,
    pub snr: f32,
    pub rssi: f32,
}

impl Reception {
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    /// On air, delivery unknown.
    Unconfirmed,
    Acknowledged { attempts: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    /// What the gateway measured for our probe.
    pub echo: ProbeEcho,
    /// What we measured for the gateway's reply.
    pub snr: f32,
    pub rssi: f32,
    pub round_trip: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub retries: u64,
    pub acks_received: u64,
    pub acks_missed: u64,
    pub packets_received: u64,
    pub duplicates_dropped: u64,
}

/// The single owner of a transceiver.
pub struct RadioLink<D> {
    driver: D,
    config: RadioConfig,
    profile: QosProfile,
    destination: Address,
    next_id: u8,
    last_seen: HashMap<Address, u8>,
    stats: LinkStats,
}

impl<D: RadioDriver> RadioLink<D> {
    /// Validates the settings and programs the transceiver. A radio that
    /// does not answer is fatal.
    pub async fn configure(mut driver: D, config: RadioConfig) -> Result<Self, RadioError> {
        config.validate()?;
        let profile = config.profile()?;
        info!(
            "QoS parameters: sf={} cr=4/{} bw={}Hz, expected byte-rate {:.1} B/s",
            profile.spreading_factor,
            profile.coding_rate,
            profile.bandwidth_hz,
            profile.byte_rate()
        );
        let settings = ModemSettings {
            profile,
            low_datarate_optimize: profile.low_datarate_optimize(),
            frequency_mhz: config.frequency_mhz,
            tx_power: config.tx_power,
            crc: true,
        };
        if let Err(e) = driver.init(&settings).await {
            error!("radio initialization failed: {}", e);
            return Err(e);
        }
        driver.set_listening(false);

        Ok(Self {
            driver,
            destination: config.base_addr,
            config,
            profile,
            next_id: 0,
            last_seen: HashMap::new(),
            stats: LinkStats::default(),
        })
    }

    pub fn node_addr(&self) -> Address {
        self.config.node_addr
    }

    pub fn profile(&self) -> &QosProfile {
        &self.profile
    }

    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    pub fn destination(&self) -> Address {
        self.destination
    }

    pub fn set_destination(&mut self, addr: Address) {
        self.destination = addr;
    }

    pub fn next_packet_id(&self) -> u8 {
        self.next_id
    }

    /// Continue the packet id sequence across power cycles.
    pub fn resume_packet_ids(&mut self, next: u8) {
        self.next_id = next;
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Switches the receiver off.
    pub fn standby(&mut self) {
        self.driver.set_listening(false);
    }

    fn trace_level(&self) -> Level {
        if self.config.trace {
            Level::Debug
        } else {
            Level::Trace
        }
    }

    /// Sends `payload` tagged as `kind` to the current destination.
    pub async fn transmit(
        &mut self,
        payload: &[u8],
        kind: MessageType,
        want_ack: bool,
        keep_listening: bool,
    ) -> Result<Sent, RadioError> {
        let framed = match kind.tag() {
            Some(tag) if payload.is_empty() => tag.as_bytes().to_vec(),
            Some(tag) => [tag.as_bytes(), b",", payload].concat(),
            None => payload.to_vec(),
        };
        self.transmit_to(self.destination, framed, want_ack, keep_listening)
            .await
    }

    pub async fn send_message(
        &mut self,
        msg: &Message,
        want_ack: bool,
        keep_listening: bool,
    ) -> Result<Sent, RadioError> {
        self.transmit_to(self.destination, msg.to_payload().into_bytes(), want_ack, keep_listening)
            .await
    }

    /// Unacknowledged single shot to `to`. The destination is left alone.
    pub async fn reply(&mut self, to: Address, payload: &[u8]) -> Result<Sent, RadioError> {
        self.transmit_to(to, payload.to_vec(), false, true).await
    }

    async fn transmit_to(
        &mut self,
        destination: Address,
        payload: Vec<u8>,
        want_ack: bool,
        keep_listening: bool,
    ) -> Result<Sent, RadioError> {
        let header = Header {
            destination,
            source: self.config.node_addr,
            packet_id: self.next_id,
            flags: 0,
        };
        let first = Packet::new(header, payload)?;
        self.next_id = self.next_id.wrapping_add(1);

        let need_ack = want_ack && destination != BROADCAST_ADDR;
        let attempts = if need_ack { self.config.ack_retries.max(1) } else { 1 };
        let timeout = self.profile.transmit_timeout(first.payload().len());
        let level = self.trace_level();

        for attempt in 0..attempts {
            let packet = if attempt == 0 {
                first.clone()
            } else {
                self.stats.retries += 1;
                first.with_flags(FLAG_RETRY)
            };
            log!(
                level,
                "sending {:?} to {} (id {}, attempt {}), xmit timeout {:.1}s",
                String::from_utf8_lossy(packet.payload()),
                destination,
                header.packet_id,
                attempt + 1,
                timeout.as_secs_f64()
            );

            let start = Instant::now();
            let bytes = packet.encode();
            match self.driver.send(&bytes, timeout).await {
                Ok(()) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += bytes.len() as u64;
                    log!(level, "elapsed: {:.3}s", start.elapsed().as_secs_f64());
                }
                Err(e) if !need_ack => {
                    self.driver.set_listening(keep_listening);
                    warn!("transmit to {} failed: {}", destination, e);
                    return Err(e);
                }
                Err(e) => warn!("transmit attempt {} failed: {}", attempt + 1, e),
            }

            if !need_ack {
                self.driver.set_listening(keep_listening);
                return Ok(Sent::Unconfirmed);
            }

            self.driver.set_listening(true);
            if self.await_ack(destination, header.packet_id).await {
                self.stats.acks_received += 1;
                self.driver.set_listening(keep_listening);
                return Ok(Sent::Acknowledged {
                    attempts: attempt + 1,
                });
            }

            if attempt + 1 < attempts {
                let base = self
                    .config
                    .backoff
                    .delay(self.config.ack_wait(), attempt as u32);
                let jitter = rand::rng().random::<f64>();
                sleep(base.mul_f64(1.0 + jitter)).await;
            }
        }

        self.stats.acks_missed += 1;
        self.driver.set_listening(keep_listening);
        warn!("no ack from {} after {} attempts", destination, attempts);
        Err(RadioError::NoAck { attempts })
    }

    async fn await_ack(&mut self, from: Address, packet_id: u8) -> bool {
        let deadline = Instant::now() + self.config.ack_wait();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.driver.receive(remaining).await {
                Ok(Some(frame)) => match Packet::decode(&frame.bytes) {
                    Ok(p)
                        if p.header().is_ack()
                            && p.header().source == from
                            && p.header().destination == self.config.node_addr
                            && p.header().packet_id == packet_id =>
                    {
                        return true;
                    }
                    Ok(p) => trace!("ignoring {:?} while waiting for ack", p.header()),
                    Err(_) => trace!("ignoring runt frame while waiting for ack"),
                },
                Ok(None) => return false,
                Err(e) => {
                    warn!("receive failed while waiting for ack: {}", e);
                    return false;
                }
            }
        }
    }

    /// Waits for a packet addressed to this node or to everyone.
    ///
    /// `None` on timeout. With `with_ack` every addressed packet is
    /// acknowledged after `ack_delay`, and retransmissions of the last
    /// packet seen from the same sender are dropped.
    pub async fn receive(&mut self, timeout: Option<Duration>, with_ack: bool) -> Option<Reception> {
        let timeout = timeout.unwrap_or_else(|| self.config.receive_timeout());
        let deadline = Instant::now() + timeout;
        let level = self.trace_level();
        let me = self.config.node_addr;
        self.driver.set_listening(true);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log!(level, "no packet within {:.2}s", timeout.as_secs_f64());
                return None;
            }
            let frame = match self.driver.receive(remaining).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log!(level, "no packet within {:.2}s", timeout.as_secs_f64());
                    return None;
                }
                Err(e) => {
                    warn!("receive failed: {}", e);
                    return None;
                }
            };
            let packet = match Packet::decode(&frame.bytes) {
                Ok(p) => p,
                Err(_) => {
                    trace!("dropping runt frame of {} bytes", frame.bytes.len());
                    continue;
                }
            };
            let header = *packet.header();
            if !header.is_for(me) || header.is_ack() {
                trace!("skipping {:?}", header);
                continue;
            }

            if with_ack && header.destination != BROADCAST_ADDR {
                sleep(self.config.ack_delay()).await;
                let ack = Packet::ack(&header, me).encode();
                if let Err(e) = self.driver.send(&ack, self.profile.transmit_timeout(0)).await {
                    warn!("failed to ack packet {} from {}: {}", header.packet_id, header.source, e);
                }
                if header.is_retry() && self.last_seen.get(&header.source) == Some(&header.packet_id) {
                    self.stats.duplicates_dropped += 1;
                    log!(level, "duplicate packet {} from {}", header.packet_id, header.source);
                    continue;
                }
                self.last_seen.insert(header.source, header.packet_id);
            }

            self.stats.packets_received += 1;
            log!(
                level,
                "received from {}: header {:?}, payload {:?}, snr {:.1}, rssi {:.0}",
                header.source,
                header,
                String::from_utf8_lossy(packet.payload()),
                frame.snr,
                frame.rssi
            );
            return Some(Reception {
                payload: packet.into_payload(),
                sender: header.source,
                snr: frame.snr,
                rssi: frame.rssi,
            });
        }
    }

    /// Best-effort round trip to the gateway to measure link quality.
    pub async fn broadcast_probe(&mut self, seq: u32, node_id: &str, now: Timestamp) -> Option<ProbeResult> {
        let probe = Message::Broadcast(BroadcastProbe {
            timestamp: now,
            node_id: node_id.to_string(),
            seq,
            node_addr: Some(self.config.node_addr),
        });
        info!("broadcast packet {}: sending at {}", seq, now);
        let start = Instant::now();
        if let Err(e) = self.send_message(&probe, false, true).await {
            warn!("broadcast packet {}: failed: {}", seq, e);
            return None;
        }
        info!("broadcast packet {}: transfer-time {:.3}s", seq, start.elapsed().as_secs_f64());

        // echoes of earlier probes may still be in flight
        let deadline = Instant::now() + self.config.receive_timeout();
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("broadcast packet {}: no echo", seq);
                break None;
            }
            let Some(reply) = self.receive(Some(remaining), false).await else {
                break None;
            };
            match reply.text().map(ProbeEcho::parse) {
                Some(Ok(echo)) if echo.seq == seq => {
                    break Some(ProbeResult {
                        echo,
                        snr: reply.snr,
                        rssi: reply.rssi,
                        round_trip: start.elapsed(),
                    });
                }
                Some(Ok(echo)) => warn!("broadcast packet {}: stale echo for {}", seq, echo.seq),
                Some(Err(e)) => warn!("broadcast packet {}: bad echo: {}", seq, e),
                None => warn!("broadcast packet {}: binary echo", seq),
            }
        };
        self.standby();
        result
    }

    /// Asks the gateway for the time. Each attempt gets a fresh timeout.
    pub async fn time_query(&mut self, retries: u8) -> Option<Timestamp> {
        let query = Message::TimeQuery {
            node_addr: Some(self.config.node_addr),
        };
        for attempt in 0..retries {
            info!("sending time-query packet, attempt {}", attempt + 1);
            let start = Instant::now();
            if let Err(e) = self.send_message(&query, false, true).await {
                warn!("time-query {} failed: {}", attempt + 1, e);
                continue;
            }
            info!("time-query {} sent in {:.3}s", attempt + 1, start.elapsed().as_secs_f64());

            let reply = self.receive(None, false).await;
            self.standby();
            let Some(reply) = reply else { continue };
            match decode_time_reply(&reply.payload).map(Timestamp::from_epoch) {
                Ok(Ok(ts)) => {
                    info!("time-query {} returned {}", attempt + 1, ts);
                    return Some(ts);
                }
                Ok(Err(e)) => warn!("time-query {}: {}", attempt + 1, e),
                Err(e) => warn!("time-query {}: {}", attempt + 1, e),
            }
        }
        warn!("time-query failed after {} attempts", retries);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RawFrame;
    use crate::frame::{FLAG_ACK, HEADER_LEN};
    use crate::message::encode_time_reply;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Wire {
        incoming: VecDeque<Option<RawFrame>>,
        sent: Vec<Vec<u8>>,
    }

    /// Replays queued frames; an empty queue or a `None` entry is a timeout.
    #[derive(Clone, Default)]
    struct ScriptedDriver {
        wire: Arc<Mutex<Wire>>,
        absent: bool,
    }

    impl ScriptedDriver {
        fn push(&self, bytes: Vec<u8>) {
            self.wire.lock().unwrap().incoming.push_back(Some(RawFrame {
                bytes,
                snr: 8.5,
                rssi: -60.0,
            }));
        }

        fn push_timeout(&self) {
            self.wire.lock().unwrap().incoming.push_back(None);
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.wire.lock().unwrap().sent.clone()
        }
    }

    #[async_trait]
    impl RadioDriver for ScriptedDriver {
        async fn init(&mut self, _settings: &ModemSettings) -> Result<(), RadioError> {
            if self.absent {
                return Err(RadioError::HardwareMissing("no reply from chip".into()));
            }
            Ok(())
        }

        async fn send(&mut self, frame: &[u8], _timeout: Duration) -> Result<(), RadioError> {
            self.wire.lock().unwrap().sent.push(frame.to_vec());
            Ok(())
        }

        async fn receive(&mut self, timeout: Duration) -> Result<Option<RawFrame>, RadioError> {
            let next = self.wire.lock().unwrap().incoming.pop_front().flatten();
            if next.is_none() {
                sleep(timeout).await;
            }
            Ok(next)
        }

        fn set_listening(&mut self, _listening: bool) {}
    }

    fn node_config() -> RadioConfig {
        RadioConfig {
            node_addr: 3,
            base_addr: 0,
            ..Default::default()
        }
    }

    async fn node_link() -> (RadioLink<ScriptedDriver>, ScriptedDriver) {
        let driver = ScriptedDriver::default();
        let link = RadioLink::configure(driver.clone(), node_config()).await.unwrap();
        (link, driver)
    }

    #[tokio::test]
    async fn test_configure_fails_without_hardware() {
        let driver = ScriptedDriver {
            absent: true,
            ..Default::default()
        };
        let result = RadioLink::configure(driver, node_config()).await;
        assert!(matches!(result, Err(RadioError::HardwareMissing(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmit_tags_and_addresses() {
        let (mut link, driver) = node_link().await;
        let sent = link.transmit(b"", MessageType::TimeQuery, false, false).await.unwrap();
        assert_eq!(sent, Sent::Unconfirmed);
        link.transmit(b"21.5,3.9", MessageType::Data, false, false).await.unwrap();

        let frames = driver.sent();
        assert_eq!(frames[0], vec![0, 3, 0, 0, b'T']);
        assert_eq!(&frames[1][..HEADER_LEN], &[0, 3, 1, 0]);
        assert_eq!(&frames[1][HEADER_LEN..], b"21.5,3.9");
        assert_eq!(link.next_packet_id(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_exhaustion_reports_failure() {
        let (mut link, driver) = node_link().await;
        let result = link.transmit(b"x", MessageType::Data, true, false).await;
        assert!(matches!(result, Err(RadioError::NoAck { attempts: 3 })));

        let frames = driver.sent();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0][3], 0);
        assert_eq!(frames[1][3], FLAG_RETRY);
        assert_eq!(frames[2][3], FLAG_RETRY);
        // retries reuse the packet id
        assert!(frames.iter().all(|f| f[2] == 0));
        assert_eq!(link.stats().acks_missed, 1);
        assert_eq!(link.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_on_second_attempt() {
        let (mut link, driver) = node_link().await;
        driver.push_timeout();
        // a stray data packet, then the ack for packet 0
        driver.push(vec![3, 0, 9, 0, b'z']);
        driver.push(vec![3, 0, 0, FLAG_ACK]);
        let sent = link.transmit(b"x", MessageType::Data, true, false).await.unwrap();
        assert_eq!(sent, Sent::Acknowledged { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_filters_and_acks() {
        let gw_config = RadioConfig {
            node_addr: 0,
            ..Default::default()
        };
        let driver = ScriptedDriver::default();
        let mut link = RadioLink::configure(driver.clone(), gw_config).await.unwrap();

        driver.push(vec![7, 3, 0, 0, b'n']); // for someone else
        driver.push(vec![0, 3, 4, 0, b'a']);
        driver.push(vec![0, 3, 4, FLAG_RETRY, b'a']); // retransmission
        driver.push(vec![0, 5, 1, 0, b'b']);

        let first = link.receive(None, true).await.unwrap();
        assert_eq!((first.payload.as_slice(), first.sender), (&b"a"[..], 3));
        let second = link.receive(None, true).await.unwrap();
        assert_eq!((second.payload.as_slice(), second.sender), (&b"b"[..], 5));
        assert!(link.receive(Some(Duration::from_secs(1)), true).await.is_none());

        let acks: Vec<_> = driver.sent();
        assert_eq!(acks, vec![vec![3, 0, 4, FLAG_ACK], vec![3, 0, 4, FLAG_ACK], vec![5, 0, 1, FLAG_ACK]]);
        assert_eq!(link.stats().duplicates_dropped, 1);
        assert_eq!(link.stats().packets_received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_query_retries_independently() {
        let (mut link, driver) = node_link().await;
        driver.push_timeout();
        let epoch = Timestamp::new(2024, 1, 9, 9, 58, 5).to_epoch().unwrap();
        let mut reply = vec![3, 0, 0, 0];
        reply.extend_from_slice(&encode_time_reply(epoch).unwrap());
        driver.push(reply);

        let ts = link.time_query(3).await;
        assert_eq!(ts, Some(Timestamp::new(2024, 1, 9, 9, 58, 5)));
        assert_eq!(driver.sent().len(), 2);
        assert_eq!(&driver.sent()[0][HEADER_LEN..], b"T,3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_query_gives_up() {
        let (mut link, driver) = node_link().await;
        assert_eq!(link.time_query(2).await, None);
        assert_eq!(driver.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_probe_roundtrip() {
        let (mut link, driver) = node_link().await;
        let mut echo = vec![3, 0, 0, 0];
        echo.extend_from_slice(b"7,9.5,-80");
        driver.push(echo);

        let now = Timestamp::new(2024, 1, 9, 9, 58, 5);
        let result = link.broadcast_probe(7, "ID1", now).await.unwrap();
        assert_eq!(result.echo.seq, 7);
        assert_eq!(result.echo.snr, 9.5);
        assert_eq!(result.echo.rssi, -80.0);
        assert_eq!(result.snr, 8.5);
        assert_eq!(&driver.sent()[0][HEADER_LEN..], b"B,2024-01-09T09:58:05,ID1,7,3");

        // unanswered probe
        assert!(link.broadcast_probe(8, "ID1", now).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_skips_stale_echo() {
        let (mut link, driver) = node_link().await;
        let mut stale = vec![3, 0, 0, 0];
        stale.extend_from_slice(b"4,9.5,-80");
        driver.push(stale);
        let mut echo = vec![3, 0, 1, 0];
        echo.extend_from_slice(b"5,7.25,-91");
        driver.push(echo);

        let now = Timestamp::new(2024, 1, 9, 9, 58, 5);
        let result = link.broadcast_probe(5, "ID1", now).await.unwrap();
        assert_eq!(result.echo.seq, 5);
        assert_eq!(result.echo.rssi, -91.0);

        // only a stale echo arrives
        let mut late = vec![3, 0, 2, 0];
        late.extend_from_slice(b"5,7.25,-91");
        driver.push(late);
        assert!(link.broadcast_probe(6, "ID1", now).await.is_none());
    }
}
