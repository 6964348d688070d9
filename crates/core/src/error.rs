use thiserror::Error;

use crate::time::Timestamp;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("malformed timestamp '{0}'")]
    Malformed(String),

    #[error("timestamp {0} is not a calendar date")]
    NotACalendarDate(Timestamp),

    #[error("epoch {0} is outside the supported range")]
    EpochOutOfRange(i64),
}

#[derive(Debug, Error)]
pub enum ClockError {
    /// The chain fell through to the sentinel date. Scheduling still works,
    /// absolute dates are wrong until the next successful sync.
    #[error("no valid time source, clock seeded with sentinel date")]
    Unavailable,

    #[error("no network connectivity for time fetch")]
    NoConnectivity,

    #[error("no time service configured")]
    NoTimeService,

    #[error("time service request failed: {0}")]
    Fetch(String),

    #[error("unexpected time service response: {0}")]
    BadResponse(String),

    #[error(transparent)]
    Time(#[from] TimeError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("time-table needs 7 daily entries, got {0}")]
    WrongDayCount(usize),

    #[error("step of zero in {0} range")]
    ZeroStep(&'static str),

    #[error("{kind} range {start}..={end} outside 0..={max}")]
    OutOfBounds {
        kind: &'static str,
        start: u8,
        end: u8,
        max: u8,
    },

    #[error("{kind} range starts at {start} after its end {end}")]
    EmptyRange { kind: &'static str, start: u8, end: u8 },

    #[error("interval must be positive")]
    ZeroInterval,

    #[error("no wake slot reachable from the time-table")]
    NoSlot,

    #[error("current time {0} cannot be used for scheduling")]
    UnusableNow(Timestamp),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot encode state: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("cannot decode state: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("no bus to probe")]
    NoBus,

    #[error("device {device} not found")]
    NotFound { device: String },

    #[error("bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor {0} not responding")]
    NotResponding(String),

    #[error("sensor {sensor}: {reason}")]
    Read { sensor: String, reason: String },

    #[error(transparent)]
    Probe(#[from] ProbeError),
}
