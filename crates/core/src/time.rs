//! Calendar timestamps as kept by real-time clocks

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::TimeError;

/// Seconds since 1970-01-01T00:00:00 local time.
pub type Epoch = i64;

pub const SECONDS_PER_DAY: Epoch = 86_400;

/// Raw RTC register contents. Values are not guaranteed to form a calendar
/// date: a clock that lost power reads whatever its registers reset to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    /// Seeded into the external RTC when no time source is available.
    pub const SENTINEL: Timestamp = Timestamp::new(2022, 1, 1, 12, 0, 0);

    /// What an internal RTC reads after a reset.
    pub const POWER_ON: Timestamp = Timestamp::new(2000, 1, 1, 0, 0, 0);

    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    /// Loose validity check. Catches reset values, not calendar errors.
    pub fn is_plausible(&self) -> bool {
        self.year > 2022
            && self.year < 2099
            && (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hour <= 24
            && self.minute <= 59
            && self.second <= 59
    }

    fn to_naive(self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?.and_hms_opt(
            self.hour as u32,
            self.minute as u32,
            self.second as u32,
        )
    }

    pub fn to_epoch(self) -> Result<Epoch, TimeError> {
        self.to_naive()
            .map(|dt| dt.and_utc().timestamp())
            .ok_or(TimeError::NotACalendarDate(self))
    }

    pub fn from_epoch(epoch: Epoch) -> Result<Self, TimeError> {
        let dt = DateTime::from_timestamp(epoch, 0).ok_or(TimeError::EpochOutOfRange(epoch))?;
        let year = u16::try_from(dt.year()).map_err(|_| TimeError::EpochOutOfRange(epoch))?;
        Ok(Self::new(
            year,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
        ))
    }

    /// Monday is 0, Sunday is 6.
    pub fn weekday(self) -> Result<u8, TimeError> {
        self.to_naive()
            .map(|dt| dt.weekday().num_days_from_monday() as u8)
            .ok_or(TimeError::NotACalendarDate(self))
    }

    pub fn seconds_into_day(self) -> Epoch {
        self.hour as Epoch * 3600 + self.minute as Epoch * 60 + self.second as Epoch
    }

    pub fn checked_add_secs(self, secs: Epoch) -> Result<Self, TimeError> {
        Self::from_epoch(self.to_epoch()? + secs)
    }

    /// Compact form used in file name templates.
    pub fn ymd(&self) -> String {
        format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

impl FromStr for Timestamp {
    type Err = TimeError;

    /// Parses `YYYY-MM-DDTHH:MM:SS`. Fractional seconds and zone suffixes
    /// after the seconds field are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TimeError::Malformed(s.to_string());
        let (date, time) = s.trim().split_once('T').ok_or_else(malformed)?;
        let time = time.get(..8).ok_or_else(malformed)?;

        let mut d = date.split('-');
        let mut t = time.split(':');
        let next = |it: &mut std::str::Split<'_, char>| -> Result<u16, TimeError> {
            it.next()
                .and_then(|v| v.parse::<u16>().ok())
                .ok_or_else(malformed)
        };
        let year = next(&mut d)?;
        let month = next(&mut d)?;
        let day = next(&mut d)?;
        let hour = next(&mut t)?;
        let minute = next(&mut t)?;
        let second = next(&mut t)?;
        if d.next().is_some() || month > 99 || day > 99 || hour > 99 || minute > 99 || second > 99 {
            return Err(malformed());
        }
        Ok(Self::new(
            year,
            month as u8,
            day as u8,
            hour as u8,
            minute as u8,
            second as u8,
        ))
    }
}
