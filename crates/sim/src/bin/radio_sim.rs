//! radio simulation for LoraLog

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use loralog_sim::{scenarios, SimulationPresets};

/// Runs nodes and a gateway over simulated channels in virtual time
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of sensor nodes
    #[arg(short, long, default_value = "3")]
    nodes: u8,

    /// Measurement cycles per node
    #[arg(short, long, default_value = "10")]
    cycles: u32,

    /// Probes in each link test
    #[arg(short, long, default_value = "10")]
    probes: u32,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    // sleeps between cycles pass instantly
    tokio::time::pause();

    println!("{}", "LoraLog Radio Simulation".bright_blue().bold());
    println!("{}", "========================".bright_blue());

    let presets = vec![
        ("Good Conditions", SimulationPresets::good_conditions()),
        ("Average Conditions", SimulationPresets::average_conditions()),
        ("Poor Conditions", SimulationPresets::poor_conditions()),
        ("Extreme Conditions", SimulationPresets::extreme_conditions()),
    ];

    for (name, conditions) in presets {
        println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
        println!(
            "Packet Loss: {}%, SNR {:.0} dB, RSSI {:.0} dBm, SF{} CR4/{}",
            (conditions.packet_loss * 100.0) as u32,
            conditions.snr_mean,
            conditions.rssi_mean,
            conditions.profile.spreading_factor,
            conditions.profile.coding_rate
        );

        let report = scenarios::field_day(conditions.clone(), args.nodes, args.cycles).await?;
        for node in &report.nodes {
            println!(
                "  node {}: {} cycles, {} acknowledged, {} unconfirmed",
                node.addr, node.cycles, node.acknowledged, node.failed
            );
        }
        let (sent, dropped, _, bytes) = report.network;
        println!(
            "  gateway received {} records, channel: {} frames ({} bytes), {} dropped",
            report.delivered, sent, bytes, dropped
        );

        let (summary, records) = scenarios::link_test(conditions, args.probes, Duration::from_secs(10)).await?;
        println!("  link test: {}/{} probes answered", summary.ok, summary.sent);
        if let Some(last) = records.last() {
            println!("  last probe seen by gateway: {}", last);
        }
        println!("{}", "-".repeat(50));
    }

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
