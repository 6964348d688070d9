//! Chained time source: network time service, external RTC, internal RTC

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::ClockError;
use crate::time::{Epoch, Timestamp};

/// A real-time clock chip or the MCU's own RTC.
pub trait Rtc: Send {
    fn datetime(&self) -> Timestamp;

    fn set_datetime(&mut self, ts: Timestamp);

    /// Battery-backed clocks report whether their oscillator stopped.
    fn lost_power(&self) -> bool {
        false
    }
}

/// Free-running software RTC. Counts seconds from the moment it was set,
/// a calendar-invalid setting freezes it at the raw value.
#[derive(Debug, Clone)]
pub struct SoftRtc {
    raw: Timestamp,
    anchor: Option<(Epoch, Instant)>,
    lost_power: bool,
}

impl SoftRtc {
    pub fn at(ts: Timestamp) -> Self {
        let mut rtc = Self {
            raw: ts,
            anchor: None,
            lost_power: false,
        };
        rtc.set_datetime(ts);
        rtc
    }

    /// State of an RTC right after a reset.
    pub fn unset() -> Self {
        Self::at(Timestamp::POWER_ON)
    }

    /// Seeded from the host's system clock.
    pub fn from_system() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as Epoch)
            .unwrap_or(0);
        Self::at(Timestamp::from_epoch(secs).unwrap_or(Timestamp::POWER_ON))
    }

    pub fn with_lost_power(mut self, lost: bool) -> Self {
        self.lost_power = lost;
        self
    }
}

impl Rtc for SoftRtc {
    fn datetime(&self) -> Timestamp {
        match self.anchor {
            Some((epoch, at)) => {
                Timestamp::from_epoch(epoch + at.elapsed().as_secs() as Epoch).unwrap_or(self.raw)
            }
            None => self.raw,
        }
    }

    fn set_datetime(&mut self, ts: Timestamp) {
        self.raw = ts;
        self.anchor = ts.to_epoch().ok().map(|epoch| (epoch, Instant::now()));
        self.lost_power = false;
    }

    fn lost_power(&self) -> bool {
        self.lost_power
    }
}

/// Network connectivity used for the time-service request.
#[async_trait]
pub trait Connectivity: Send {
    async fn get_text(&mut self, url: &str) -> Result<String, ClockError>;

    /// Switch the network radio off again after a request.
    fn power_down(&mut self) {}
}

pub struct NetTime {
    pub connectivity: Box<dyn Connectivity>,
    pub url: String,
}

/// Which link of the chain provided the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    ExternalRtc,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockStatus {
    Updated(TimeSource),
    AlreadyValid,
}

/// Sole owner of "current time" on a device.
pub struct ClockAuthority {
    internal: Box<dyn Rtc>,
    external: Box<dyn Rtc>,
    net: Option<NetTime>,
}

impl ClockAuthority {
    pub fn new(internal: Box<dyn Rtc>, external: Box<dyn Rtc>) -> Self {
        Self {
            internal,
            external,
            net: None,
        }
    }

    pub fn with_net_time(mut self, net: NetTime) -> Self {
        self.net = Some(net);
        self
    }

    pub fn current_time(&self) -> Timestamp {
        self.internal.datetime()
    }

    pub fn now_epoch(&self) -> Result<Epoch, ClockError> {
        Ok(self.current_time().to_epoch()?)
    }

    pub fn external_time(&self) -> Timestamp {
        self.external.datetime()
    }

    /// Make the internal RTC valid.
    ///
    /// A valid internal RTC is trusted and pushed to the external RTC.
    /// Otherwise the external RTC is used, refreshed from the time service
    /// first if it lost power or is invalid itself. With no source left the
    /// external RTC gets [`Timestamp::SENTINEL`], the internal RTC is synced
    /// from it anyway and [`ClockError::Unavailable`] is returned.
    pub async fn ensure_valid(&mut self, wifi_available: bool) -> Result<ClockStatus, ClockError> {
        let int_ts = self.internal.datetime();
        debug!("rtc int: {}", int_ts);

        if usable(int_ts) {
            info!("assuming valid internal rtc, updating external rtc");
            self.external.set_datetime(int_ts);
            return Ok(ClockStatus::AlreadyValid);
        }

        let mut status = Ok(ClockStatus::Updated(TimeSource::ExternalRtc));
        if self.external.lost_power() || !usable(self.external.datetime()) {
            debug!("rtc ext: {}", self.external.datetime());
            match self.fetch_network_time(wifi_available).await {
                Ok(ts) => {
                    info!("external rtc updated from time service: {}", ts);
                    self.external.set_datetime(ts);
                    status = Ok(ClockStatus::Updated(TimeSource::Network));
                }
                Err(e) => {
                    warn!("time service unavailable ({}), setting external rtc to {}", e, Timestamp::SENTINEL);
                    self.external.set_datetime(Timestamp::SENTINEL);
                    status = Err(ClockError::Unavailable);
                }
            }
        }

        let ext_ts = self.external.datetime();
        info!("updating internal rtc from external rtc: {}", ext_ts);
        self.internal.set_datetime(ext_ts);
        status
    }

    /// Apply a time obtained from a peer or upstream.
    pub fn set_epoch(&mut self, epoch: Epoch) -> Result<(), ClockError> {
        let ts = Timestamp::from_epoch(epoch)?;
        info!("setting clock to {}", ts);
        self.external.set_datetime(ts);
        self.internal.set_datetime(ts);
        Ok(())
    }

    async fn fetch_network_time(&mut self, wifi_available: bool) -> Result<Timestamp, ClockError> {
        if !wifi_available {
            return Err(ClockError::NoConnectivity);
        }
        let net = self.net.as_mut().ok_or(ClockError::NoTimeService)?;
        let body = net.connectivity.get_text(&net.url).await;
        net.connectivity.power_down();
        parse_time_response(&body?)
    }
}

/// Plausible and a real calendar date, so schedules can be computed from it.
fn usable(ts: Timestamp) -> bool {
    ts.is_plausible() && ts.to_epoch().is_ok()
}

/// Decode a time-service response. Accepts a `struct_time` array or a
/// `datetime` string.
pub fn parse_time_response(body: &str) -> Result<Timestamp, ClockError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ClockError::BadResponse(e.to_string()))?;

    if let Some(fields) = value.get("struct_time").and_then(Value::as_array) {
        let nums: Vec<u64> = fields.iter().take(6).filter_map(Value::as_u64).collect();
        if nums.len() < 6 {
            return Err(ClockError::BadResponse("short struct_time".to_string()));
        }
        let narrow = |v: u64| u8::try_from(v).map_err(|_| ClockError::BadResponse(format!("field {} out of range", v)));
        let year = u16::try_from(nums[0])
            .map_err(|_| ClockError::BadResponse(format!("year {} out of range", nums[0])))?;
        return Ok(Timestamp::new(
            year,
            narrow(nums[1])?,
            narrow(nums[2])?,
            narrow(nums[3])?,
            narrow(nums[4])?,
            narrow(nums[5])?,
        ));
    }

    let datetime = value
        .get("datetime")
        .and_then(Value::as_str)
        .ok_or_else(|| ClockError::BadResponse("no datetime field".to_string()))?;
    Ok(datetime.parse()?)
}
