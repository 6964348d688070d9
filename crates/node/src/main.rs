use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use loralog_core::{load_json, ClockAuthority, FileStore, NoPowerControl, SoftRtc};
use loralog_node::{build_sensors, NodeAgent, NodeConfig, Wake};
use loralog_radio::{RadioLink, UdpRadio};
use tokio::time::sleep;

/// LoraLog sensor node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node configuration (JSON), defaults apply without one
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run one cycle and exit
    #[arg(long)]
    once: bool,

    /// Run the link test instead of measuring
    #[arg(long)]
    probe: bool,
}

async fn build_agent(config: &NodeConfig) -> Result<NodeAgent<UdpRadio>> {
    let clock = ClockAuthority::new(Box::new(SoftRtc::from_system()), Box::new(SoftRtc::from_system()));
    let store = FileStore::new(&config.data_dir);
    let sensors = build_sensors(&config.sensors, &config.logger_id);
    let mut agent =
        NodeAgent::new(config.clone(), clock, Box::new(store), Box::new(NoPowerControl))?.with_sensors(sensors);

    match (&config.radio, &config.udp) {
        (Some(radio), Some(udp)) => {
            let driver = UdpRadio::from_transport(udp).await?;
            agent = agent.with_radio(RadioLink::configure(driver, radio.clone()).await?);
        }
        (Some(_), None) => warn!("radio configured without a udp transport, running without radio"),
        _ => {}
    }
    Ok(agent)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config: NodeConfig = match &args.config {
        Some(path) => load_json(path).with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };
    config.validate()?;
    info!("starting node {}", config.logger_id);

    if args.probe || config.probe.is_some() {
        let probe = config.probe.clone().unwrap_or_default();
        let mut agent = build_agent(&config).await?;
        let summary = agent
            .probe_session(probe.count, Duration::from_secs(probe.interval_secs))
            .await?;
        info!("link test finished: {}/{} ok", summary.ok, summary.sent);
        return Ok(());
    }

    let mut cold = true;
    loop {
        // deep sleep: nothing of the agent survives
        let pause = {
            let mut agent = build_agent(&config).await?;
            let mut report = if cold {
                agent.cold_boot().await?
            } else {
                agent.resume_from_wake().await?
            };
            cold = false;

            loop {
                if args.once {
                    info!("single cycle done, next step {:?}", report.next);
                    return Ok(());
                }
                match agent.suspend(report.next).await {
                    Wake::Continue => report = agent.run_cycle().await?,
                    Wake::Restart(pause) => break pause,
                    Wake::Off | Wake::Halted => return Ok(()),
                }
            }
        };
        sleep(pause).await;
    }
}
