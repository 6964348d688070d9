//! Wake scheduling from a weekly time-table or a fixed interval

use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;
use crate::time::{Epoch, Timestamp, SECONDS_PER_DAY};

/// Inclusive `start..=end` range walked with `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u8, u8, u8)", into = "(u8, u8, u8)")]
pub struct StepRange {
    pub start: u8,
    pub end: u8,
    pub step: u8,
}

impl StepRange {
    pub const fn new(start: u8, end: u8, step: u8) -> Self {
        Self { start, end, step }
    }

    pub fn values(&self) -> impl Iterator<Item = u8> {
        (self.start..=self.end).step_by(self.step.max(1) as usize)
    }

    fn validate(&self, kind: &'static str, max: u8) -> Result<(), ScheduleError> {
        if self.step == 0 {
            return Err(ScheduleError::ZeroStep(kind));
        }
        if self.start > max || self.end > max {
            return Err(ScheduleError::OutOfBounds {
                kind,
                start: self.start,
                end: self.end,
                max,
            });
        }
        if self.start > self.end {
            return Err(ScheduleError::EmptyRange {
                kind,
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

impl From<(u8, u8, u8)> for StepRange {
    fn from((start, end, step): (u8, u8, u8)) -> Self {
        Self { start, end, step }
    }
}

impl From<StepRange> for (u8, u8, u8) {
    fn from(r: StepRange) -> Self {
        (r.start, r.end, r.step)
    }
}

/// One day of a time-table. Serialized as `null` or `[[h0,h1,hs],[m0,m1,ms]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<(StepRange, StepRange)>", into = "Option<(StepRange, StepRange)>")]
pub enum DayEntry {
    Skip,
    Slots { hours: StepRange, minutes: StepRange },
}

impl From<Option<(StepRange, StepRange)>> for DayEntry {
    fn from(v: Option<(StepRange, StepRange)>) -> Self {
        match v {
            Some((hours, minutes)) => DayEntry::Slots { hours, minutes },
            None => DayEntry::Skip,
        }
    }
}

impl From<DayEntry> for Option<(StepRange, StepRange)> {
    fn from(d: DayEntry) -> Self {
        match d {
            DayEntry::Slots { hours, minutes } => Some((hours, minutes)),
            DayEntry::Skip => None,
        }
    }
}

impl DayEntry {
    pub const fn slots(hours: (u8, u8, u8), minutes: (u8, u8, u8)) -> Self {
        DayEntry::Slots {
            hours: StepRange::new(hours.0, hours.1, hours.2),
            minutes: StepRange::new(minutes.0, minutes.1, minutes.2),
        }
    }

    /// Seconds after start of day, ascending.
    fn offsets(&self) -> Vec<Epoch> {
        match self {
            DayEntry::Skip => Vec::new(),
            DayEntry::Slots { hours, minutes } => hours
                .values()
                .flat_map(|h| minutes.values().map(move |m| h as Epoch * 3600 + m as Epoch * 60))
                .collect(),
        }
    }
}

/// Weekly table, Monday first. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<DayEntry>", into = "Vec<DayEntry>")]
pub struct TimeTable {
    days: [DayEntry; 7],
}

impl TimeTable {
    pub fn new(days: [DayEntry; 7]) -> Result<Self, ScheduleError> {
        for day in &days {
            if let DayEntry::Slots { hours, minutes } = day {
                hours.validate("hour", 23)?;
                minutes.validate("minute", 59)?;
            }
        }
        Ok(Self { days })
    }

    pub fn day(&self, weekday: u8) -> &DayEntry {
        &self.days[weekday as usize % 7]
    }

    /// First table instant strictly after `now`.
    ///
    /// Days are scanned from today with wrap-around. Today is looked at
    /// twice (now and a week later), so a table with a single active day
    /// still yields a slot after that day's last one has passed.
    pub fn next_after(&self, now: Timestamp) -> Result<Timestamp, ScheduleError> {
        let unusable = |_| ScheduleError::UnusableNow(now);
        let now_epoch = now.to_epoch().map_err(unusable)?;
        let weekday = now.weekday().map_err(unusable)?;
        let mut start_of_day = now_epoch - now.seconds_into_day();

        debug!("looking up next wake from time-table, now {} (weekday {})", now, weekday);
        for i in 0..=7u8 {
            let entry = self.day(weekday + i);
            if let Some(offset) = entry
                .offsets()
                .into_iter()
                .find(|offset| start_of_day + offset > now_epoch)
            {
                return Timestamp::from_epoch(start_of_day + offset).map_err(unusable);
            }
            start_of_day += SECONDS_PER_DAY;
        }
        Err(ScheduleError::NoSlot)
    }
}

impl TryFrom<Vec<DayEntry>> for TimeTable {
    type Error = ScheduleError;

    fn try_from(days: Vec<DayEntry>) -> Result<Self, Self::Error> {
        let n = days.len();
        let days: [DayEntry; 7] = days.try_into().map_err(|_| ScheduleError::WrongDayCount(n))?;
        Self::new(days)
    }
}

impl From<TimeTable> for Vec<DayEntry> {
    fn from(t: TimeTable) -> Self {
        t.days.to_vec()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WakeSchedule {
    Table(TimeTable),
    Interval(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Scheduled,
    /// Battery below threshold, resumption pushed far into the future.
    LowBattery,
}

/// Result of a wake computation. A low-battery plan must be acknowledged
/// before its deadline may be armed and power cut.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct WakePlan {
    pub deadline: Timestamp,
    pub reason: WakeReason,
    acknowledged: bool,
}

impl WakePlan {
    pub fn scheduled(deadline: Timestamp) -> Self {
        Self {
            deadline,
            reason: WakeReason::Scheduled,
            acknowledged: true,
        }
    }

    pub fn acknowledge_low_battery(&mut self) {
        self.acknowledged = true;
    }

    /// `None` while a low-battery plan is unacknowledged.
    pub fn armable_deadline(&self) -> Option<Timestamp> {
        self.acknowledged.then_some(self.deadline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepKind {
    Light,
    Deep,
}

pub const LOW_BATTERY_WAKE_DAYS: Epoch = 365;

#[derive(Debug, Clone)]
pub struct WakeScheduler {
    schedule: WakeSchedule,
    low_battery_volts: Option<f32>,
}

impl WakeScheduler {
    pub fn new(schedule: WakeSchedule) -> Self {
        Self {
            schedule,
            low_battery_volts: None,
        }
    }

    pub fn with_low_battery_threshold(mut self, volts: Option<f32>) -> Self {
        self.low_battery_volts = volts;
        self
    }

    pub fn schedule(&self) -> &WakeSchedule {
        &self.schedule
    }

    pub fn next_wake(&self, now: Timestamp, battery: Option<f32>) -> Result<WakePlan, ScheduleError> {
        if let (Some(threshold), Some(volts)) = (self.low_battery_volts, battery) {
            if volts < threshold {
                warn!("battery at {:.2}V below {:.2}V: wakeup disabled", volts, threshold);
                let deadline = now
                    .checked_add_secs(LOW_BATTERY_WAKE_DAYS * SECONDS_PER_DAY)
                    .map_err(|_| ScheduleError::UnusableNow(now))?;
                return Ok(WakePlan {
                    deadline,
                    reason: WakeReason::LowBattery,
                    acknowledged: false,
                });
            }
        }

        let deadline = match &self.schedule {
            WakeSchedule::Table(table) => table.next_after(now)?,
            WakeSchedule::Interval(secs) => {
                if *secs == 0 {
                    return Err(ScheduleError::ZeroInterval);
                }
                now.checked_add_secs(*secs as Epoch)
                    .map_err(|_| ScheduleError::UnusableNow(now))?
            }
        };
        info!("next wake: {}", deadline);
        Ok(WakePlan::scheduled(deadline))
    }
}

/// Light sleep for short gaps, deep sleep otherwise.
pub fn sleep_kind(gap: Duration, light_sleep_max: Duration) -> SleepKind {
    if gap <= light_sleep_max {
        SleepKind::Light
    } else {
        SleepKind::Deep
    }
}
