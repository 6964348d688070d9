use loralog_core::{ConfigError, ScheduleError};
use loralog_radio::RadioError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("radio: {0}")]
    Radio(#[from] RadioError),

    #[error("cannot compute next window: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("upstream: {0}")]
    Upstream(String),

    #[error("upstream buffer: {0}")]
    Io(#[from] std::io::Error),
}
