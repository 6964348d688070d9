use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use loralog_core::{load_json, ClockAuthority, NoPowerControl, SoftRtc};
use loralog_gateway::{build_upstream, GatewayAgent, GatewayConfig};
use loralog_radio::{RadioLink, UdpRadio};

/// LoraLog gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Gateway configuration (JSON), defaults apply without one
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep the gateway on, ignoring the configured window length
    #[arg(long)]
    always_on: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config: GatewayConfig = match &args.config {
        Some(path) => load_json(path).with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if args.always_on {
        config.on_duration_secs = 0;
    }
    config.validate()?;

    let Some(udp) = config.udp.clone() else {
        bail!("no radio transport configured (udp)");
    };
    let driver = UdpRadio::from_transport(&udp).await?;
    info!("gateway listening on {}", driver.local_addr()?);
    let radio = RadioLink::configure(driver, config.radio.clone()).await?;

    let clock = ClockAuthority::new(Box::new(SoftRtc::from_system()), Box::new(SoftRtc::from_system()));
    let upstream = build_upstream(&config.upstream);
    let mut gateway = GatewayAgent::new(config, clock, radio, upstream, Box::new(NoPowerControl))?;
    gateway.run().await?;
    Ok(())
}
