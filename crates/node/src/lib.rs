//! LoraLog sensor node: measure, store, transmit and sleep until the next
//! scheduled wake.

pub mod agent;
pub mod config;
pub mod error;
pub mod sensors;

pub use agent::{CycleReport, NextStep, NodeAgent, ProbeOutcome, ProbeSummary, TimeAcquired, TransmitStatus, Wake};
pub use config::{NodeConfig, ProbeConfig, TransmitPolicy};
pub use error::NodeError;
pub use sensors::{build_sensors, SensorSpec};
