use loralog_core::{ConfigError, ScheduleError};
use loralog_radio::RadioError;
use thiserror::Error;

/// Conditions that stop a node cycle. Everything else degrades.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("radio: {0}")]
    Radio(#[from] RadioError),

    #[error("cannot compute next wake: {0}")]
    Schedule(#[from] ScheduleError),
}
