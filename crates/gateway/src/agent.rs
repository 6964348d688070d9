//! Active-window state machine of the gateway.
//!
//! The gateway listens during a window, answers probes and time queries and
//! hands data to the upstream. On a receive timeout after the window end it
//! syncs the upstream, computes the next window and asks for its power to be
//! cut. When nothing cuts it, the window is extended to the end of the next
//! one and listening goes on.

use std::time::Duration;

use log::{debug, error, info, warn};
use loralog_core::{ClockAuthority, Epoch, PowerBridge, ScheduleError, Timestamp, WakeDeadline, WakeScheduler};
use loralog_radio::message::encode_time_reply;
use loralog_radio::{Address, Message, MessageType, ProbeEcho, RadioDriver, RadioLink, Reception};
use tokio::time::{sleep, Instant};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::upstream::{ProbeRecord, Upstream};

const TIME_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Listening,
    Dispatching,
    SyncingUpstream,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindow {
    pub start: Timestamp,
    /// `None` never closes.
    pub end: Option<Timestamp>,
}

impl ActiveWindow {
    pub fn expired(&self, now: Timestamp) -> bool {
        self.end.is_some_and(|end| now > end)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub data: u64,
    pub probes: u64,
    pub time_queries: u64,
    pub rejected: u64,
    pub replies_failed: u64,
}

/// Outcome of one [`GatewayAgent::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Idle,
    Dispatched(MessageType),
    Rejected,
    /// No shutdown happened, the window now ends later.
    Extended(ActiveWindow),
    PoweredOff,
}

fn add_secs(ts: Timestamp, secs: u64) -> Result<Timestamp, ScheduleError> {
    ts.checked_add_secs(secs as Epoch)
        .map_err(|_| ScheduleError::UnusableNow(ts))
}

pub struct GatewayAgent<D> {
    config: GatewayConfig,
    clock: ClockAuthority,
    scheduler: WakeScheduler,
    radio: RadioLink<D>,
    upstream: Box<dyn Upstream>,
    power: Box<dyn PowerBridge>,
    state: GatewayState,
    window: ActiveWindow,
    booted: Instant,
    stats: DispatchStats,
}

impl<D: RadioDriver> GatewayAgent<D> {
    pub fn new(
        config: GatewayConfig,
        clock: ClockAuthority,
        radio: RadioLink<D>,
        upstream: Box<dyn Upstream>,
        power: Box<dyn PowerBridge>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let scheduler = config.schedule.scheduler()?;
        let window = ActiveWindow {
            start: clock.current_time(),
            end: None,
        };
        Ok(Self {
            config,
            clock,
            scheduler,
            radio,
            upstream,
            power,
            state: GatewayState::Listening,
            window,
            booted: Instant::now(),
            stats: DispatchStats::default(),
        })
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn window(&self) -> ActiveWindow {
        self.window
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn clock(&self) -> &ClockAuthority {
        &self.clock
    }

    pub fn radio(&self) -> &RadioLink<D> {
        &self.radio
    }

    /// Validates the clock, falling back to upstream time, and opens the
    /// first window.
    pub async fn boot(&mut self) -> Result<ActiveWindow, GatewayError> {
        self.booted = Instant::now();
        if let Err(e) = self.clock.ensure_valid(self.config.net_update).await {
            warn!("clock update failed: {}", e);
            self.time_from_upstream().await;
        }
        let now = self.clock.current_time();
        self.window = self.window_from(now)?;
        match self.window.end {
            Some(end) => info!("active window {} - {}", now, end),
            None => info!("always on since {}", now),
        }
        self.state = GatewayState::Listening;
        Ok(self.window)
    }

    async fn time_from_upstream(&mut self) {
        for attempt in 1..=self.config.time_retries {
            match self.upstream.get_time().await {
                Some(epoch) => match self.clock.set_epoch(epoch) {
                    Ok(()) => {
                        info!("clock set from upstream time");
                        return;
                    }
                    Err(e) => warn!("upstream time {} unusable: {}", epoch, e),
                },
                None => debug!("no upstream time, attempt {}", attempt),
            }
            if attempt < self.config.time_retries {
                sleep(TIME_RETRY_DELAY).await;
            }
        }
        warn!("no upstream time, running on {}", self.clock.current_time());
    }

    fn window_from(&self, start: Timestamp) -> Result<ActiveWindow, GatewayError> {
        let end = match self.config.on_duration() {
            Some(d) => Some(add_secs(start, d.as_secs())?),
            None => None,
        };
        Ok(ActiveWindow { start, end })
    }

    /// Boots and serves until the power is cut.
    pub async fn run(&mut self) -> Result<(), GatewayError> {
        self.boot().await?;
        loop {
            if self.poll().await? == Step::PoweredOff {
                info!("powered off, {:?}", self.stats);
                return Ok(());
            }
        }
    }

    /// One receive with the gateway timeout, followed by dispatch or the
    /// window check.
    pub async fn poll(&mut self) -> Result<Step, GatewayError> {
        self.state = GatewayState::Listening;
        match self.radio.receive(Some(self.config.receive_timeout()), true).await {
            Some(rx) => Ok(self.dispatch(rx).await),
            None => {
                let now = self.clock.current_time();
                if self.window.expired(now) {
                    self.close_window(now).await
                } else {
                    Ok(Step::Idle)
                }
            }
        }
    }

    async fn dispatch(&mut self, rx: Reception) -> Step {
        self.state = GatewayState::Dispatching;
        let step = match Message::parse_bytes(&rx.payload) {
            Ok(msg) => {
                let kind = msg.kind();
                let reply_to = msg.reply_addr().unwrap_or(rx.sender);
                self.handle(msg, reply_to, &rx).await;
                Step::Dispatched(kind)
            }
            Err(e) => {
                warn!("dropping packet from {}: {}", rx.sender, e);
                self.stats.rejected += 1;
                Step::Rejected
            }
        };
        self.state = GatewayState::Listening;
        step
    }

    async fn handle(&mut self, msg: Message, reply_to: Address, rx: &Reception) {
        match msg {
            Message::Data(line) => {
                self.stats.data += 1;
                if let Err(e) = self.upstream.process(rx.sender, &line).await {
                    warn!("upstream did not take data from {}: {}", rx.sender, e);
                }
            }
            Message::Broadcast(probe) => {
                self.stats.probes += 1;
                let echo = ProbeEcho {
                    seq: probe.seq,
                    snr: rx.snr,
                    rssi: rx.rssi,
                };
                let reply_ok = self.reply(reply_to, echo.to_string().as_bytes()).await;
                let record = ProbeRecord {
                    probe,
                    node_addr: reply_to,
                    reply_ok,
                    snr: rx.snr,
                    rssi: rx.rssi,
                    profile: *self.radio.profile(),
                };
                if let Err(e) = self.upstream.process_probe(&record).await {
                    warn!("upstream did not take probe record: {}", e);
                }
            }
            Message::TimeQuery { .. } => {
                self.stats.time_queries += 1;
                let now = self.clock.current_time();
                match now.to_epoch().map(encode_time_reply) {
                    Ok(Ok(bytes)) => {
                        debug!("time query from {}, answering {}", reply_to, now);
                        self.reply(reply_to, &bytes).await;
                    }
                    Ok(Err(e)) => warn!("cannot answer time query from {}: {}", reply_to, e),
                    Err(e) => warn!("cannot answer time query from {}: {}", reply_to, e),
                }
            }
        }
    }

    /// Single best-effort reply. Failures are counted, never retried.
    async fn reply(&mut self, to: Address, payload: &[u8]) -> bool {
        match self.radio.reply(to, payload).await {
            Ok(_) => true,
            Err(e) => {
                warn!("reply to {} failed: {}", to, e);
                self.stats.replies_failed += 1;
                false
            }
        }
    }

    async fn close_window(&mut self, now: Timestamp) -> Result<Step, GatewayError> {
        if let Some(dev) = &self.config.dev_mode {
            let min_uptime = Duration::from_secs(dev.min_uptime_secs);
            let up = self.booted.elapsed();
            if up < min_uptime {
                let remaining = (min_uptime - up).as_secs().max(1);
                debug!("dev mode: shutdown deferred for {}s", remaining);
                self.window.end = Some(add_secs(now, remaining)?);
                return Ok(Step::Extended(self.window));
            }
        }
        info!("active window ended, {:?}", self.stats);

        self.state = GatewayState::SyncingUpstream;
        match self.upstream.flush().await {
            Ok(outcome) => debug!("upstream sync: {:?}", outcome),
            Err(e) => warn!("upstream sync failed: {}", e),
        }

        self.state = GatewayState::ShuttingDown;
        let now = self.clock.current_time();
        let next_start = match self.scheduler.next_wake(now, None) {
            Ok(plan) => plan.deadline,
            Err(e) => {
                error!("cannot compute next window: {}", e);
                return Err(e.into());
            }
        };
        let deadline = match &self.config.dev_mode {
            Some(dev) => WakeDeadline::new(add_secs(now, dev.sleep_secs)?, Duration::from_secs(dev.sleep_secs)),
            None => {
                let unusable = |_| ScheduleError::UnusableNow(now);
                let gap = next_start.to_epoch().map_err(unusable)? - now.to_epoch().map_err(unusable)?;
                WakeDeadline::new(next_start, Duration::from_secs(gap.max(0) as u64))
            }
        };
        let wake_at = deadline.at;

        self.radio.standby();
        info!("shutting down until {}", wake_at);
        if self.upstream.shutdown(&deadline).await || self.power.cut_power_until(deadline).await {
            return Ok(Step::PoweredOff);
        }

        self.window = self.window_from(wake_at)?;
        warn!(
            "power-down failed, listening until {}",
            self.window.end.map_or_else(|| "further notice".to_string(), |e| e.to_string())
        );
        self.state = GatewayState::Listening;
        Ok(Step::Extended(self.window))
    }
}
