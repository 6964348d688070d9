//! Uplink collaborators: where the gateway's records go and who may cut its
//! power.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use loralog_core::{Epoch, WakeDeadline};
use loralog_radio::{Address, BroadcastProbe, QosProfile};
use tokio::time::{sleep, Instant};

use crate::error::GatewayError;

/// An answered broadcast probe, enriched with what the gateway saw.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRecord {
    pub probe: BroadcastProbe,
    pub node_addr: Address,
    pub reply_ok: bool,
    pub snr: f32,
    pub rssi: f32,
    pub profile: QosProfile,
}

impl fmt::Display for ProbeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{:.1},{:.0},{},{},{}",
            self.probe.timestamp,
            self.probe.node_id,
            self.probe.seq,
            self.node_addr,
            u8::from(self.reply_ok),
            self.snr,
            self.rssi,
            self.profile.spreading_factor,
            self.profile.coding_rate,
            self.profile.bandwidth_hz
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Complete,
    /// Data stays with the hub for a later sync.
    TimedOut,
}

#[async_trait]
pub trait Upstream: Send {
    /// A data record from node `from`.
    async fn process(&mut self, from: Address, line: &str) -> Result<(), GatewayError>;

    async fn process_probe(&mut self, record: &ProbeRecord) -> Result<(), GatewayError>;

    /// Time as known by the uplink, for bootstrapping the gateway clock.
    async fn get_time(&mut self) -> Option<Epoch>;

    /// Pushes everything buffered. Returns when the uplink has synced or
    /// gave up.
    async fn flush(&mut self) -> Result<SyncOutcome, GatewayError>;

    /// Asks the uplink to power the gateway down until `deadline`. `true`
    /// when it will.
    async fn shutdown(&mut self, deadline: &WakeDeadline) -> bool;
}

/// No uplink. Records end up in the log only.
#[derive(Debug, Default)]
pub struct NoopUpstream;

#[async_trait]
impl Upstream for NoopUpstream {
    async fn process(&mut self, from: Address, line: &str) -> Result<(), GatewayError> {
        info!("data from {}: {}", from, line);
        Ok(())
    }

    async fn process_probe(&mut self, record: &ProbeRecord) -> Result<(), GatewayError> {
        info!("probe: {}", record);
        Ok(())
    }

    async fn get_time(&mut self) -> Option<Epoch> {
        None
    }

    async fn flush(&mut self) -> Result<SyncOutcome, GatewayError> {
        Ok(SyncOutcome::Complete)
    }

    async fn shutdown(&mut self, _deadline: &WakeDeadline) -> bool {
        false
    }
}

/// Store-and-forward uplink device, e.g. a cellular notecard.
#[async_trait]
pub trait Hub: Send {
    async fn send_notes(&mut self, lines: &[String]) -> Result<(), GatewayError>;
    async fn start_sync(&mut self) -> Result<(), GatewayError>;
    async fn sync_complete(&mut self) -> Result<bool, GatewayError>;
    async fn time(&mut self) -> Option<Epoch>;

    /// `true` when the hub will cut the gateway's power and restore it
    /// after `seconds`.
    async fn sleep_with_timer(&mut self, seconds: u64) -> bool;
}

/// Host hub: notes are appended to a local outbox file, the system clock is
/// the time source and power cannot be cut.
#[derive(Debug)]
pub struct OutboxHub {
    outbox: PathBuf,
}

impl OutboxHub {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self { outbox: outbox.into() }
    }
}

fn append_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

#[async_trait]
impl Hub for OutboxHub {
    async fn send_notes(&mut self, lines: &[String]) -> Result<(), GatewayError> {
        append_lines(&self.outbox, lines)?;
        debug!("{} notes written to {}", lines.len(), self.outbox.display());
        Ok(())
    }

    async fn start_sync(&mut self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn sync_complete(&mut self) -> Result<bool, GatewayError> {
        Ok(true)
    }

    async fn time(&mut self) -> Option<Epoch> {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs() as Epoch)
    }

    async fn sleep_with_timer(&mut self, _seconds: u64) -> bool {
        false
    }
}

/// Buffers records in a file during the window and hands them to a [`Hub`]
/// when the window ends.
pub struct BufferedUpstream<H> {
    buffer: PathBuf,
    hub: H,
    max_sync: Duration,
    poll: Duration,
}

impl<H: Hub> BufferedUpstream<H> {
    pub fn new(buffer: impl Into<PathBuf>, hub: H, max_sync: Duration, poll: Duration) -> Self {
        Self {
            buffer: buffer.into(),
            hub,
            max_sync,
            poll,
        }
    }

    pub fn hub(&self) -> &H {
        &self.hub
    }

    fn buffered(&self) -> Result<Vec<String>, GatewayError> {
        match fs::read_to_string(&self.buffer) {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<H: Hub> Upstream for BufferedUpstream<H> {
    async fn process(&mut self, from: Address, line: &str) -> Result<(), GatewayError> {
        debug!("buffering data from {}", from);
        append_lines(&self.buffer, &[line.to_string()])?;
        Ok(())
    }

    async fn process_probe(&mut self, record: &ProbeRecord) -> Result<(), GatewayError> {
        append_lines(&self.buffer, &[format!("probe,{}", record)])?;
        Ok(())
    }

    async fn get_time(&mut self) -> Option<Epoch> {
        self.hub.time().await
    }

    async fn flush(&mut self) -> Result<SyncOutcome, GatewayError> {
        let lines = self.buffered()?;
        if !lines.is_empty() {
            self.hub.send_notes(&lines).await?;
            fs::remove_file(&self.buffer)?;
            info!("handed {} buffered lines to the hub", lines.len());
        }

        self.hub.start_sync().await?;
        let started = Instant::now();
        loop {
            if self.hub.sync_complete().await? {
                info!("upstream sync complete after {:.1}s", started.elapsed().as_secs_f64());
                return Ok(SyncOutcome::Complete);
            }
            if started.elapsed() >= self.max_sync {
                warn!("upstream sync not complete after {:?}, giving up", self.max_sync);
                return Ok(SyncOutcome::TimedOut);
            }
            sleep(self.poll).await;
        }
    }

    async fn shutdown(&mut self, deadline: &WakeDeadline) -> bool {
        info!("asking hub to power down until {}", deadline.at);
        self.hub.sleep_with_timer(deadline.sleep_for.as_secs()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loralog_core::Timestamp;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct HubState {
        notes: Vec<String>,
        polls: u32,
        sleeps: Vec<u64>,
    }

    /// Sync completes on poll number `done_after`, never if `None`.
    #[derive(Clone, Default)]
    struct FakeHub {
        state: Arc<Mutex<HubState>>,
        done_after: Option<u32>,
        powers_down: bool,
    }

    #[async_trait]
    impl Hub for FakeHub {
        async fn send_notes(&mut self, lines: &[String]) -> Result<(), GatewayError> {
            self.state.lock().unwrap().notes.extend_from_slice(lines);
            Ok(())
        }

        async fn start_sync(&mut self) -> Result<(), GatewayError> {
            self.state.lock().unwrap().polls = 0;
            Ok(())
        }

        async fn sync_complete(&mut self) -> Result<bool, GatewayError> {
            let mut state = self.state.lock().unwrap();
            state.polls += 1;
            Ok(self.done_after.is_some_and(|n| state.polls >= n))
        }

        async fn time(&mut self) -> Option<Epoch> {
            Some(1_704_877_200)
        }

        async fn sleep_with_timer(&mut self, seconds: u64) -> bool {
            self.state.lock().unwrap().sleeps.push(seconds);
            self.powers_down
        }
    }

    fn probe_record() -> ProbeRecord {
        ProbeRecord {
            probe: BroadcastProbe {
                timestamp: Timestamp::new(2024, 1, 10, 9, 0, 0),
                node_id: "lg1".to_string(),
                seq: 7,
                node_addr: Some(3),
            },
            node_addr: 3,
            reply_ok: true,
            snr: 9.3,
            rssi: -71.0,
            profile: QosProfile::default(),
        }
    }

    #[test]
    fn test_probe_record_format() {
        assert_eq!(
            probe_record().to_string(),
            "2024-01-10T09:00:00,lg1,7,3,1,9.3,-71,8,7,125000"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_hands_over_and_clears_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = dir.path().join("buffer.csv");
        let hub = FakeHub {
            done_after: Some(3),
            ..Default::default()
        };
        let mut upstream = BufferedUpstream::new(&buffer, hub.clone(), Duration::from_secs(300), Duration::from_secs(1));

        upstream.process(3, "2024-01-10T09:00:00,lg1,3.71").await.unwrap();
        upstream.process_probe(&probe_record()).await.unwrap();

        let started = Instant::now();
        assert_eq!(upstream.flush().await.unwrap(), SyncOutcome::Complete);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(!buffer.exists());

        let notes = hub.state.lock().unwrap().notes.clone();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0], "2024-01-10T09:00:00,lg1,3.71");
        assert!(notes[1].starts_with("probe,2024-01-10T09:00:00,lg1,7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_gives_up_after_max_sync() {
        let dir = tempfile::tempdir().unwrap();
        let hub = FakeHub::default();
        let mut upstream = BufferedUpstream::new(
            dir.path().join("buffer.csv"),
            hub.clone(),
            Duration::from_secs(10),
            Duration::from_secs(1),
        );

        let started = Instant::now();
        assert_eq!(upstream.flush().await.unwrap(), SyncOutcome::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(hub.state.lock().unwrap().polls, 11);
    }

    #[tokio::test]
    async fn test_shutdown_goes_through_hub() {
        let dir = tempfile::tempdir().unwrap();
        let hub = FakeHub {
            powers_down: true,
            ..Default::default()
        };
        let mut upstream = BufferedUpstream::new(dir.path().join("b"), hub.clone(), Duration::ZERO, Duration::from_secs(1));
        let deadline = WakeDeadline::new(Timestamp::new(2024, 1, 10, 10, 0, 0), Duration::from_secs(3000));

        assert!(upstream.shutdown(&deadline).await);
        assert_eq!(hub.state.lock().unwrap().sleeps, vec![3000]);
        assert_eq!(upstream.get_time().await, Some(1_704_877_200));
        assert!(!NoopUpstream.shutdown(&deadline).await);
    }

    #[tokio::test]
    async fn test_outbox_hub_appends() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = dir.path().join("out").join("notes.csv");
        let mut hub = OutboxHub::new(&outbox);
        hub.send_notes(&["a".to_string()]).await.unwrap();
        hub.send_notes(&["b".to_string(), "c".to_string()]).await.unwrap();
        assert_eq!(fs::read_to_string(&outbox).unwrap(), "a\nb\nc\n");
        assert!(hub.sync_complete().await.unwrap());
    }
}
