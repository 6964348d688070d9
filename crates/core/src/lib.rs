//! core time keeping, wake scheduling and device collaborators for LoraLog

pub mod clock;
pub mod config;
pub mod error;
pub mod persist;
pub mod power;
pub mod schedule;
pub mod sensor;
pub mod time;

pub use clock::{ClockAuthority, ClockStatus, Connectivity, NetTime, Rtc, SoftRtc, TimeSource};
pub use config::{load_json, ScheduleConfig};
pub use error::{ClockError, ConfigError, PersistError, ProbeError, ScheduleError, SensorError, TimeError};
pub use persist::{expand_template, FileStore, MemoryStore, NvState, NvStore, Persistence};
pub use power::{ControlLine, DonePinBridge, NoPowerControl, PowerBridge, WakeAlarm, WakeDeadline};
pub use schedule::{DayEntry, SleepKind, StepRange, TimeTable, WakePlan, WakeReason, WakeSchedule, WakeScheduler};
pub use sensor::{probe_first, Battery, ReadingContext, Sensor, VoltageMonitor};
pub use time::{Epoch, Timestamp};
