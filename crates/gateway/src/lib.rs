//! LoraLog gateway: listens during active windows, answers probes and time
//! queries, forwards data upstream and powers down between windows.

pub mod agent;
pub mod config;
pub mod error;
pub mod upstream;

pub use agent::{ActiveWindow, DispatchStats, GatewayAgent, GatewayState, Step};
pub use config::{DevMode, GatewayConfig, UpstreamConfig};
pub use error::GatewayError;
pub use upstream::{BufferedUpstream, Hub, NoopUpstream, OutboxHub, ProbeRecord, SyncOutcome, Upstream};

use std::time::Duration;

/// Builds the upstream selected in the configuration.
pub fn build_upstream(config: &UpstreamConfig) -> Box<dyn Upstream> {
    match config {
        UpstreamConfig::Noop => Box::new(NoopUpstream),
        UpstreamConfig::Buffered {
            buffer,
            outbox,
            max_sync_secs,
            poll_secs,
        } => Box::new(BufferedUpstream::new(
            buffer,
            OutboxHub::new(outbox),
            Duration::from_secs(*max_sync_secs),
            Duration::from_secs(*poll_secs),
        )),
    }
}
