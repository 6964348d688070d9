//! Simulation scenarios: nodes and a gateway sharing one simulated channel

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use loralog_core::{ClockAuthority, Epoch, MemoryStore, NoPowerControl, ScheduleConfig, SoftRtc, Timestamp, WakeDeadline};
use loralog_gateway::{GatewayAgent, GatewayConfig, GatewayError, ProbeRecord, SyncOutcome, Upstream};
use loralog_node::{build_sensors, NodeAgent, NodeConfig, NodeError, ProbeSummary, SensorSpec, TransmitPolicy, TransmitStatus, Wake};
use loralog_radio::{Address, ChannelConditions, RadioConfig, RadioLink, SimulatedRadio, SimulatedRadioNetwork};
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub const GATEWAY_ADDR: Address = 0;

/// Wall clock of every device when a scenario starts.
pub const SIM_START: Timestamp = Timestamp::new(2024, 1, 10, 8, 0, 0);

/// Upstream that keeps everything the gateway hands over.
#[derive(Clone, Default)]
pub struct CollectingUpstream {
    data: Arc<Mutex<Vec<(Address, String)>>>,
    probes: Arc<Mutex<Vec<ProbeRecord>>>,
}

impl CollectingUpstream {
    pub fn data(&self) -> Vec<(Address, String)> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn probes(&self) -> Vec<ProbeRecord> {
        self.probes.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Upstream for CollectingUpstream {
    async fn process(&mut self, from: Address, line: &str) -> Result<(), GatewayError> {
        self.data
            .lock()
            .map_err(|_| GatewayError::Upstream("collector poisoned".to_string()))?
            .push((from, line.to_string()));
        Ok(())
    }

    async fn process_probe(&mut self, record: &ProbeRecord) -> Result<(), GatewayError> {
        self.probes
            .lock()
            .map_err(|_| GatewayError::Upstream("collector poisoned".to_string()))?
            .push(record.clone());
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

pub fn clock_at(ts: Timestamp) -> ClockAuthority {
    ClockAuthority::new(Box::new(SoftRtc::at(ts)), Box::new(SoftRtc::at(ts)))
}

/// Strobe-mode node measuring every minute with acknowledged transmits.
pub fn node_config(addr: Address, state_dir: &Path) -> NodeConfig {
    NodeConfig {
        logger_id: format!("lg{}", addr),
        radio: Some(RadioConfig {
            node_addr: addr,
            base_addr: GATEWAY_ADDR,
            ..Default::default()
        }),
        schedule: ScheduleConfig {
            interval_secs: 60,
            ..Default::default()
        },
        transmit: TransmitPolicy::Acknowledged,
        csv_template: None,
        nv_path: state_dir.join(format!("nv_{}.bin", addr)),
        sensors: vec![
            SensorSpec::Id,
            SensorSpec::Battery {
                volts: Some(3.9),
                path: None,
            },
        ],
        ..Default::default()
    }
}

pub async fn node_agent(
    net: &Arc<SimulatedRadioNetwork>,
    config: NodeConfig,
    clock: ClockAuthority,
) -> Result<NodeAgent<SimulatedRadio>, NodeError> {
    let radio_cfg = config.radio.clone().unwrap_or_default();
    let link = RadioLink::configure(net.join(radio_cfg.node_addr).await, radio_cfg).await?;
    let sensors = build_sensors(&config.sensors, &config.logger_id);
    Ok(NodeAgent::new(config, clock, Box::new(MemoryStore::new()), Box::new(NoPowerControl))?
        .with_radio(link)
        .with_sensors(sensors))
}

/// An always-on gateway serving until the handle is aborted.
pub async fn spawn_gateway(
    net: &Arc<SimulatedRadioNetwork>,
    upstream: CollectingUpstream,
) -> Result<JoinHandle<Result<(), GatewayError>>, GatewayError> {
    let config = GatewayConfig {
        on_duration_secs: 0,
        ..Default::default()
    };
    let radio = RadioLink::configure(net.join(GATEWAY_ADDR).await, config.radio.clone()).await?;
    let mut gateway = GatewayAgent::new(
        config,
        clock_at(SIM_START),
        radio,
        Box::new(upstream),
        Box::new(NoPowerControl),
    )?;
    Ok(tokio::spawn(async move { gateway.run().await }))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeTally {
    pub addr: Address,
    pub cycles: u32,
    pub acknowledged: u32,
    pub failed: u32,
}

/// Runs `cycles` measurement cycles of one node. Power is never really cut,
/// so every power-off turns into a sleep followed by a resume.
pub async fn run_node(
    net: &Arc<SimulatedRadioNetwork>,
    addr: Address,
    state_dir: &Path,
    cycles: u32,
    stagger: Duration,
) -> Result<NodeTally, NodeError> {
    let mut agent = node_agent(net, node_config(addr, state_dir), clock_at(SIM_START)).await?;
    sleep(stagger).await;

    let mut tally = NodeTally {
        addr,
        ..Default::default()
    };
    let mut report = agent.cold_boot().await?;
    loop {
        tally.cycles += 1;
        match report.transmit {
            TransmitStatus::Acknowledged => tally.acknowledged += 1,
            TransmitStatus::Failed => tally.failed += 1,
            _ => {}
        }
        if tally.cycles >= cycles {
            return Ok(tally);
        }
        match agent.suspend(report.next).await {
            Wake::Continue => report = agent.run_cycle().await?,
            Wake::Restart(pause) => {
                sleep(pause).await;
                report = agent.resume_from_wake().await?;
            }
            Wake::Off | Wake::Halted => return Ok(tally),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldReport {
    pub nodes: Vec<NodeTally>,
    /// Data records that reached the upstream.
    pub delivered: usize,
    /// (sent, dropped, delivered, bytes) on the channel.
    pub network: (u64, u64, u64, u64),
}

impl FieldReport {
    pub fn acknowledged(&self) -> u32 {
        self.nodes.iter().map(|n| n.acknowledged).sum()
    }
}

/// Several nodes reporting to one gateway for a number of cycles.
pub async fn field_day(conditions: ChannelConditions, nodes: u8, cycles: u32) -> anyhow::Result<FieldReport> {
    info!("field day: {} nodes, {} cycles, {:?}", nodes, cycles, conditions);
    let state_dir = tempfile::tempdir()?;
    let net = SimulatedRadioNetwork::new(conditions);
    let upstream = CollectingUpstream::default();
    let gateway = spawn_gateway(&net, upstream.clone()).await?;

    let mut handles = Vec::new();
    for addr in 1..=nodes {
        let net = Arc::clone(&net);
        let dir = state_dir.path().to_path_buf();
        // keep the nodes from talking over each other
        let stagger = Duration::from_secs(addr as u64 * 7);
        handles.push(tokio::spawn(async move { run_node(&net, addr, &dir, cycles, stagger).await }));
    }

    let mut tallies = Vec::new();
    for handle in handles {
        tallies.push(handle.await??);
    }
    gateway.abort();

    Ok(FieldReport {
        nodes: tallies,
        delivered: upstream.data().len(),
        network: net.get_stats().await,
    })
}

/// Link test of node 1 against an always-on gateway.
pub async fn link_test(
    conditions: ChannelConditions,
    count: u32,
    interval: Duration,
) -> anyhow::Result<(ProbeSummary, Vec<ProbeRecord>)> {
    info!("link test: {} probes, {:?}", count, conditions);
    let state_dir = tempfile::tempdir()?;
    let net = SimulatedRadioNetwork::new(conditions);
    let upstream = CollectingUpstream::default();
    let gateway = spawn_gateway(&net, upstream.clone()).await?;

    let mut agent = node_agent(&net, node_config(1, state_dir.path()), clock_at(SIM_START)).await?;
    let summary = agent.probe_session(count, interval).await?;
    gateway.abort();
    Ok((summary, upstream.probes()))
}
