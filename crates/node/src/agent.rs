//! One measurement cycle of a sensor node.
//!
//! A cycle is linear: acquire time, collect, store, transmit, schedule the
//! next wake and hand over to the power bridge or sleep. Everything before
//! the scheduling step degrades on failure; only a wake time that cannot be
//! computed ends the cycle with an error.
//!
//! Deep sleep and power-off lose all memory. State that must survive them
//! lives in [`NvState`] and the cycle restarts through
//! [`NodeAgent::resume_from_wake`].

use std::time::Duration;

use log::{error, info, warn};
use loralog_core::schedule::sleep_kind;
use loralog_core::{
    expand_template, ClockAuthority, ClockStatus, ConfigError, Connectivity, NetTime, NvState, NvStore,
    Persistence, PowerBridge, ReadingContext, ScheduleError, Sensor, SleepKind, Timestamp, TimeSource,
    WakeDeadline, WakePlan, WakeReason, WakeScheduler,
};
use loralog_radio::{MessageType, ProbeResult, RadioDriver, RadioLink, Sent};
use tokio::time::{sleep, Instant};

use crate::config::{NodeConfig, TransmitPolicy};
use crate::error::NodeError;

/// A wake more than this many seconds before the armed deadline was not
/// caused by the alarm.
const EARLY_WAKE_TOLERANCE: i64 = 5;

/// Where the time of this cycle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAcquired {
    Valid,
    Updated(TimeSource),
    Gateway,
    WakeHint,
    /// Scheduling works, absolute dates are wrong.
    Sentinel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitStatus {
    Skipped,
    Sent,
    Acknowledged,
    /// Not confirmed. The cycle carried on.
    Failed,
}

#[derive(Debug)]
pub enum NextStep {
    /// Strobe mode: alarm armed, main power to be cut.
    PowerOff(WakeDeadline),
    /// Continuous mode, memory kept.
    LightSleep { until: Timestamp, duration: Duration },
    /// Continuous mode, memory lost.
    DeepSleep { until: Timestamp, duration: Duration },
    /// Low battery without acknowledgement: nothing armed.
    Halt,
}

/// How execution continues after [`NodeAgent::suspend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Light sleep is over, run the next cycle in place.
    Continue,
    /// Memory is gone after `Duration`, re-enter through `resume_from_wake`.
    Restart(Duration),
    /// The power controller took over.
    Off,
    Halted,
}

#[derive(Debug)]
pub struct CycleReport {
    pub time: TimeAcquired,
    pub timestamp: Timestamp,
    /// `None` when the cycle was skipped after an early wake.
    pub record: Option<String>,
    pub transmit: TransmitStatus,
    pub plan: Option<WakePlan>,
    pub next: NextStep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub seq: u32,
    pub result: Option<ProbeResult>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeSummary {
    pub sent: u32,
    pub ok: u32,
    pub outcomes: Vec<ProbeOutcome>,
}

pub struct NodeAgent<D> {
    config: NodeConfig,
    clock: ClockAuthority,
    scheduler: WakeScheduler,
    radio: Option<RadioLink<D>>,
    sensors: Vec<Box<dyn Sensor>>,
    store: Box<dyn Persistence>,
    power: Box<dyn PowerBridge>,
    nv: NvStore,
    state: NvState,
}

fn seconds_until(now: Timestamp, deadline: Timestamp) -> Result<(i64, Duration), ScheduleError> {
    let unusable = |_| ScheduleError::UnusableNow(now);
    let target = deadline.to_epoch().map_err(unusable)?;
    let gap = (target - now.to_epoch().map_err(unusable)?).max(0);
    Ok((target, Duration::from_secs(gap as u64)))
}

impl<D: RadioDriver> NodeAgent<D> {
    pub fn new(
        config: NodeConfig,
        clock: ClockAuthority,
        store: Box<dyn Persistence>,
        power: Box<dyn PowerBridge>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let scheduler = config.schedule.scheduler()?;
        let nv = NvStore::new(&config.nv_path);
        Ok(Self {
            config,
            clock,
            scheduler,
            radio: None,
            sensors: Vec::new(),
            store,
            power,
            nv,
            state: NvState::default(),
        })
    }

    pub fn with_radio(mut self, link: RadioLink<D>) -> Self {
        self.radio = Some(link);
        self
    }

    pub fn with_sensors(mut self, sensors: Vec<Box<dyn Sensor>>) -> Self {
        self.sensors = sensors;
        self
    }

    /// Network time service used when both RTCs are invalid.
    pub fn with_connectivity(mut self, connectivity: Box<dyn Connectivity>) -> Self {
        if let Some(url) = self.config.time_url.clone() {
            self.clock = self.clock.with_net_time(NetTime { connectivity, url });
        } else {
            warn!("connectivity given but no time_url configured");
        }
        self
    }

    pub fn clock(&self) -> &ClockAuthority {
        &self.clock
    }

    pub fn radio(&self) -> Option<&RadioLink<D>> {
        self.radio.as_ref()
    }

    pub fn nv_state(&self) -> &NvState {
        &self.state
    }

    fn load_state(&mut self) {
        self.state = self.nv.load();
        if let Some(link) = self.radio.as_mut() {
            link.resume_packet_ids(self.state.next_packet_id);
        }
    }

    fn save_state(&mut self) {
        if let Some(link) = self.radio.as_ref() {
            self.state.next_packet_id = link.next_packet_id();
        }
        if let Err(e) = self.nv.save(&self.state) {
            warn!("could not save state to {}: {}", self.nv.path().display(), e);
        }
    }

    /// Entry point after reset or first power-up.
    pub async fn cold_boot(&mut self) -> Result<CycleReport, NodeError> {
        info!("{}: cold boot", self.config.logger_id);
        self.load_state();
        self.run_cycle().await
    }

    /// Entry point after power-off or deep sleep. A wake well before the
    /// armed deadline goes straight back to sleep.
    pub async fn resume_from_wake(&mut self) -> Result<CycleReport, NodeError> {
        info!("{}: resume from wake", self.config.logger_id);
        self.load_state();
        let time = self.acquire_time().await;

        if let Some(hint) = self.state.wake_hint.filter(|_| time != TimeAcquired::Sentinel) {
            let now = self.clock.current_time();
            let now_epoch = now.to_epoch().map_err(|_| ScheduleError::UnusableNow(now))?;
            if now_epoch + EARLY_WAKE_TOLERANCE < hint {
                let until = Timestamp::from_epoch(hint).map_err(|_| ScheduleError::UnusableNow(now))?;
                let duration = Duration::from_secs((hint - now_epoch) as u64);
                warn!("woke {:?} before the armed wake at {}, back to sleep", duration, until);
                let next = if self.config.schedule.strobe_mode {
                    NextStep::PowerOff(WakeDeadline::new(until, duration))
                } else {
                    NextStep::DeepSleep { until, duration }
                };
                return Ok(CycleReport {
                    time,
                    timestamp: now,
                    record: None,
                    transmit: TransmitStatus::Skipped,
                    plan: None,
                    next,
                });
            }
        }
        self.measure_and_schedule(time).await
    }

    /// One full cycle with memory intact, e.g. after a light sleep.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, NodeError> {
        let time = self.acquire_time().await;
        self.measure_and_schedule(time).await
    }

    async fn acquire_time(&mut self) -> TimeAcquired {
        match self.clock.ensure_valid(self.config.net_update).await {
            Ok(ClockStatus::AlreadyValid) => return TimeAcquired::Valid,
            Ok(ClockStatus::Updated(source)) => return TimeAcquired::Updated(source),
            Err(e) => warn!("clock update failed: {}", e),
        }

        if self.config.query_gateway_time {
            if let Some(link) = self.radio.as_mut() {
                if let Some(ts) = link.time_query(self.config.time_query_retries).await {
                    match ts.to_epoch().map(|epoch| self.clock.set_epoch(epoch)) {
                        Ok(Ok(())) => {
                            info!("updated device time from gateway time");
                            return TimeAcquired::Gateway;
                        }
                        _ => warn!("gateway time {} unusable", ts),
                    }
                }
            }
        }

        if self.config.schedule.save_wakeup {
            if let Some(hint) = self.state.wake_hint {
                match self.clock.set_epoch(hint) {
                    Ok(()) => {
                        info!("restored clock from saved wakeup time");
                        return TimeAcquired::WakeHint;
                    }
                    Err(e) => warn!("could not restore clock from saved wakeup time: {}", e),
                }
            }
        }

        warn!("no time source, continuing with {}", self.clock.current_time());
        TimeAcquired::Sentinel
    }

    async fn measure_and_schedule(&mut self, time: TimeAcquired) -> Result<CycleReport, NodeError> {
        let timestamp = self.clock.current_time();
        let mut ctx = ReadingContext::new(timestamp);
        let record = self.collect(&mut ctx);
        self.persist(&timestamp, &record);
        let transmit = self.transmit(&record).await;

        let (plan, next) = match self.plan_next(ctx.battery) {
            Ok(planned) => planned,
            Err(e) => {
                error!("cannot compute next wake: {}", e);
                return Err(e.into());
            }
        };
        self.save_state();

        Ok(CycleReport {
            time,
            timestamp,
            record: Some(record),
            transmit,
            plan: Some(plan),
            next,
        })
    }

    fn collect(&mut self, ctx: &mut ReadingContext) -> String {
        let mut record = ctx.timestamp.to_string();
        for sensor in self.sensors.iter_mut() {
            let value = sensor.read(ctx).unwrap_or_else(|e| {
                warn!("sensor {} failed: {}", sensor.name(), e);
                String::new()
            });
            record.push(',');
            record.push_str(&value);
        }
        info!("record: {}", record);
        record
    }

    fn persist(&mut self, timestamp: &Timestamp, record: &str) {
        let Some(template) = &self.config.csv_template else {
            return;
        };
        let path = expand_template(template, &self.config.logger_id, timestamp);
        if let Err(e) = self.store.append_line(&path, record) {
            warn!("could not save record to {}: {}", path, e);
        }
    }

    async fn transmit(&mut self, record: &str) -> TransmitStatus {
        let want_ack = match self.config.transmit {
            TransmitPolicy::Off => return TransmitStatus::Skipped,
            TransmitPolicy::BestEffort => false,
            TransmitPolicy::Acknowledged => true,
        };
        let Some(link) = self.radio.as_mut() else {
            return TransmitStatus::Skipped;
        };
        match link.transmit(record.as_bytes(), MessageType::Data, want_ack, false).await {
            Ok(Sent::Acknowledged { attempts }) => {
                info!("record acknowledged after {} attempt(s)", attempts);
                TransmitStatus::Acknowledged
            }
            Ok(Sent::Unconfirmed) => TransmitStatus::Sent,
            Err(e) => {
                warn!("transmit failed, continuing without confirmation: {}", e);
                TransmitStatus::Failed
            }
        }
    }

    fn plan_next(&mut self, battery: Option<f32>) -> Result<(WakePlan, NextStep), ScheduleError> {
        let schedule = &self.config.schedule;
        let now = self.clock.current_time();
        let mut plan = self.scheduler.next_wake(now, battery)?;

        if plan.reason == WakeReason::LowBattery {
            if schedule.acknowledge_low_battery {
                plan.acknowledge_low_battery();
                self.state.low_battery_ack = true;
            } else {
                warn!("low battery: power-off suppressed until acknowledged");
            }
        } else {
            self.state.low_battery_ack = false;
        }

        let Some(deadline) = plan.armable_deadline() else {
            return Ok((plan, NextStep::Halt));
        };
        let (target, duration) = seconds_until(now, deadline)?;
        self.state.wake_hint = Some(target);

        let battery_ok = battery.map_or(true, |v| v >= schedule.continuous_stop_volts);
        let continuous = !schedule.strobe_mode && plan.reason == WakeReason::Scheduled && battery_ok;
        if !schedule.strobe_mode && !continuous {
            warn!("battery low, leaving continuous mode");
        }

        let next = if continuous {
            info!("continuous mode: next measurement at {}", deadline);
            let light_max = Duration::from_secs(schedule.light_sleep_max_secs as u64);
            match sleep_kind(duration, light_max) {
                SleepKind::Light => NextStep::LightSleep {
                    until: deadline,
                    duration,
                },
                SleepKind::Deep => NextStep::DeepSleep {
                    until: deadline,
                    duration,
                },
            }
        } else {
            NextStep::PowerOff(WakeDeadline::new(deadline, duration))
        };
        Ok((plan, next))
    }

    /// Carries out the step chosen by a cycle.
    pub async fn suspend(&mut self, next: NextStep) -> Wake {
        if let Some(link) = self.radio.as_mut() {
            link.standby();
        }
        match next {
            NextStep::PowerOff(deadline) => {
                let until = deadline.at;
                let fallback = deadline.sleep_for;
                if self.power.cut_power_until(deadline).await {
                    Wake::Off
                } else {
                    info!("wakeup from deep-sleep at {}", until);
                    Wake::Restart(fallback)
                }
            }
            NextStep::LightSleep { duration, .. } => {
                sleep(duration).await;
                Wake::Continue
            }
            NextStep::DeepSleep { until, duration } => {
                info!("wakeup from deep-sleep at {}", until);
                Wake::Restart(duration)
            }
            NextStep::Halt => {
                warn!("wakeup disabled, halting");
                Wake::Halted
            }
        }
    }

    /// Link test: time from the gateway, then `count` probes spaced by
    /// `interval`.
    pub async fn probe_session(&mut self, count: u32, interval: Duration) -> Result<ProbeSummary, NodeError> {
        let Some(link) = self.radio.as_mut() else {
            return Err(ConfigError::Invalid {
                field: "probe",
                reason: "needs a radio".to_string(),
            }
            .into());
        };

        match link.time_query(self.config.time_query_retries).await {
            Some(ts) => match ts.to_epoch().map(|epoch| self.clock.set_epoch(epoch)) {
                Ok(Ok(())) => info!("updated device time from gateway time"),
                _ => warn!("gateway time {} unusable", ts),
            },
            None => warn!("time update from gateway failed"),
        }

        let mut summary = ProbeSummary::default();
        for seq in 1..=count {
            let started = Instant::now();
            let now = self.clock.current_time();
            let result = link.broadcast_probe(seq, &self.config.logger_id, now).await;
            summary.sent += 1;
            match result {
                Some(r) if r.echo.seq == seq => {
                    summary.ok += 1;
                    info!(
                        "packet {}: gateway snr {:.1} rssi {:.0}, own snr {:.1} rssi {:.0}, count {}/{} ok",
                        seq, r.echo.snr, r.echo.rssi, r.snr, r.rssi, summary.ok, summary.sent
                    );
                }
                _ => warn!("packet {} failed, count {}/{} ok", seq, summary.ok, summary.sent),
            }
            summary.outcomes.push(ProbeOutcome {
                seq,
                result,
                elapsed: started.elapsed(),
            });
            if seq < count {
                sleep(interval.saturating_sub(started.elapsed())).await;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::IdSensor;
    use async_trait::async_trait;
    use loralog_core::{DayEntry, MemoryStore, SoftRtc, TimeTable, VoltageMonitor, Battery, SensorError};
    use loralog_radio::message::encode_time_reply;
    use loralog_radio::{ChannelConditions, Message, ProbeEcho, RadioConfig, SimulatedRadio, SimulatedRadioNetwork};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct RecordingPower {
        armed: Arc<Mutex<Vec<(Timestamp, Duration)>>>,
        confirms: bool,
    }

    #[async_trait]
    impl PowerBridge for RecordingPower {
        async fn cut_power_until(&mut self, deadline: WakeDeadline) -> bool {
            self.armed.lock().unwrap().push((deadline.at, deadline.sleep_for));
            self.confirms
        }
    }

    struct Volts(f32);

    impl VoltageMonitor for Volts {
        fn volts(&mut self) -> Result<f32, SensorError> {
            Ok(self.0)
        }
    }

    struct Harness {
        agent: NodeAgent<SimulatedRadio>,
        store: MemoryStore,
        power: RecordingPower,
        _dir: TempDir,
    }

    fn workweek() -> TimeTable {
        let day = DayEntry::slots((7, 17, 1), (0, 59, 15));
        TimeTable::new([day, day, day, day, day, DayEntry::Skip, DayEntry::Skip]).unwrap()
    }

    fn config(dir: &TempDir) -> NodeConfig {
        NodeConfig {
            logger_id: "lg1".to_string(),
            radio: Some(RadioConfig {
                node_addr: 3,
                ..Default::default()
            }),
            nv_path: dir.path().join("nv.bin"),
            ..Default::default()
        }
    }

    async fn harness(config: NodeConfig, dir: TempDir, clock: ClockAuthority, net: &Arc<SimulatedRadioNetwork>) -> Harness {
        let store = MemoryStore::new();
        let power = RecordingPower::default();
        let radio_cfg = config.radio.clone().unwrap_or_default();
        let link = RadioLink::configure(net.join(radio_cfg.node_addr).await, radio_cfg)
            .await
            .unwrap();
        let agent = NodeAgent::new(config, clock, Box::new(store.clone()), Box::new(power.clone()))
            .unwrap()
            .with_radio(link)
            .with_sensors(vec![Box::new(IdSensor::new("lg1"))]);
        Harness {
            agent,
            store,
            power,
            _dir: dir,
        }
    }

    fn valid_clock(ts: Timestamp) -> ClockAuthority {
        ClockAuthority::new(Box::new(SoftRtc::at(ts)), Box::new(SoftRtc::at(ts)))
    }

    fn dead_clock() -> ClockAuthority {
        ClockAuthority::new(
            Box::new(SoftRtc::unset()),
            Box::new(SoftRtc::unset().with_lost_power(true)),
        )
    }

    /// Answers time queries and probes like a gateway would.
    async fn fake_gateway(net: &Arc<SimulatedRadioNetwork>, now: Timestamp) {
        let mut link = RadioLink::configure(net.join(0).await, RadioConfig::default())
            .await
            .unwrap();
        tokio::spawn(async move {
            while let Some(rx) = link.receive(Some(Duration::from_secs(3600)), true).await {
                match rx.text().map(Message::parse) {
                    Some(Ok(Message::TimeQuery { .. })) => {
                        let reply = encode_time_reply(now.to_epoch().unwrap()).unwrap();
                        link.reply(rx.sender, &reply).await.unwrap();
                    }
                    Some(Ok(Message::Broadcast(probe))) => {
                        let echo = ProbeEcho {
                            seq: probe.seq,
                            snr: rx.snr,
                            rssi: rx.rssi,
                        };
                        link.reply(rx.sender, echo.to_string().as_bytes()).await.unwrap();
                    }
                    _ => {}
                }
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_transmit_still_arms_wake() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Acknowledged;
        let now = Timestamp::new(2024, 1, 10, 12, 0, 0);
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let mut h = harness(cfg, dir, valid_clock(now), &net).await;

        let report = h.agent.cold_boot().await.unwrap();
        assert_eq!(report.transmit, TransmitStatus::Failed);
        let NextStep::PowerOff(deadline) = report.next else {
            panic!("expected power off, got {:?}", report.next);
        };
        assert_eq!(deadline.sleep_for, Duration::from_secs(900));
        let at = deadline.at;

        assert_eq!(h.agent.suspend(NextStep::PowerOff(deadline)).await, Wake::Restart(Duration::from_secs(900)));
        assert_eq!(h.power.armed.lock().unwrap()[0].0, at);
        assert_eq!(h.agent.nv_state().wake_hint, Some(at.to_epoch().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_schedule_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        cfg.schedule.strobe_mode = false;
        cfg.schedule.time_table = Some(workweek());
        let now = Timestamp::new(2024, 1, 10, 16, 50, 0);
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let mut h = harness(cfg, dir, valid_clock(now), &net).await;

        let report = h.agent.cold_boot().await.unwrap();
        assert_eq!(report.time, TimeAcquired::Valid);
        assert_eq!(report.record.as_deref(), Some("2024-01-10T16:50:00,lg1"));
        assert_eq!(
            h.store.lines_in("log_lg1_2024-01-10.csv"),
            vec!["2024-01-10T16:50:00,lg1".to_string()]
        );
        match report.next {
            NextStep::DeepSleep { until, duration } => {
                assert_eq!(until, Timestamp::new(2024, 1, 10, 17, 0, 0));
                assert_eq!(duration, Duration::from_secs(600));
            }
            other => panic!("expected deep sleep, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_strobe_mode_follows_time_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        cfg.schedule.strobe_mode = true;
        cfg.schedule.time_table = Some(workweek());
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let mut h = harness(cfg, dir, valid_clock(Timestamp::new(2024, 1, 10, 16, 50, 0)), &net).await;

        let report = h.agent.cold_boot().await.unwrap();
        let NextStep::PowerOff(deadline) = report.next else {
            panic!("expected power off, got {:?}", report.next);
        };
        assert_eq!(deadline.at, Timestamp::new(2024, 1, 10, 17, 0, 0));
        assert_eq!(deadline.sleep_for, Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_interval_light_sleeps() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        cfg.schedule.strobe_mode = false;
        let minutely = DayEntry::slots((0, 23, 1), (0, 59, 1));
        cfg.schedule.time_table = Some(TimeTable::new([minutely; 7]).unwrap());
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let mut h = harness(cfg, dir, valid_clock(Timestamp::new(2024, 1, 10, 12, 0, 0)), &net).await;

        let report = h.agent.cold_boot().await.unwrap();
        assert!(matches!(report.next, NextStep::LightSleep { duration, .. } if duration == Duration::from_secs(60)));
        assert_eq!(h.agent.suspend(report.next).await, Wake::Continue);

        let second = h.agent.run_cycle().await.unwrap();
        assert_eq!(second.timestamp, Timestamp::new(2024, 1, 10, 12, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_battery_leaves_continuous_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        cfg.schedule.strobe_mode = false;
        cfg.schedule.time_table = Some(workweek());
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let h = harness(cfg, dir, valid_clock(Timestamp::new(2024, 1, 10, 12, 0, 0)), &net).await;
        let mut agent = h.agent.with_sensors(vec![Box::new(Battery::new(Volts(3.05)))]);

        let report = agent.cold_boot().await.unwrap();
        assert_eq!(report.record.as_deref(), Some("2024-01-10T12:00:00,3.05"));
        assert!(matches!(report.next, NextStep::PowerOff(ref d) if d.sleep_for == Duration::from_secs(900)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_depleted_battery_disables_wake() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        cfg.schedule.acknowledge_low_battery = false;
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let h = harness(cfg, dir, valid_clock(Timestamp::new(2024, 1, 10, 12, 0, 0)), &net).await;
        let mut agent = h.agent.with_sensors(vec![Box::new(Battery::new(Volts(2.9)))]);

        let report = agent.cold_boot().await.unwrap();
        assert_eq!(report.plan.as_ref().map(|p| p.reason), Some(WakeReason::LowBattery));
        assert!(matches!(report.next, NextStep::Halt));
        assert_eq!(agent.suspend(report.next).await, Wake::Halted);
        assert!(h.power.armed.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_low_battery_sleeps_a_year() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let h = harness(cfg, dir, valid_clock(Timestamp::new(2024, 1, 10, 12, 0, 0)), &net).await;
        let mut agent = h.agent.with_sensors(vec![Box::new(Battery::new(Volts(2.9)))]);

        let report = agent.cold_boot().await.unwrap();
        let NextStep::PowerOff(deadline) = report.next else {
            panic!("expected power off");
        };
        assert_eq!(deadline.at, Timestamp::new(2025, 1, 9, 12, 0, 0));
        assert!(agent.nv_state().low_battery_ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_table_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        cfg.schedule.strobe_mode = false;
        cfg.schedule.time_table = Some(TimeTable::new([DayEntry::Skip; 7]).unwrap());
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let mut h = harness(cfg, dir, valid_clock(Timestamp::new(2024, 1, 10, 12, 0, 0)), &net).await;

        let result = h.agent.cold_boot().await;
        assert!(matches!(result, Err(NodeError::Schedule(ScheduleError::NoSlot))));
        // the record was still stored
        assert_eq!(h.store.lines().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_from_gateway_when_clock_dead() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        let gateway_now = Timestamp::new(2024, 1, 9, 9, 58, 5);
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        fake_gateway(&net, gateway_now).await;
        let mut h = harness(cfg, dir, dead_clock(), &net).await;

        let report = h.agent.cold_boot().await.unwrap();
        assert_eq!(report.time, TimeAcquired::Gateway);
        assert_eq!(report.timestamp.ymd(), "2024-01-09");
    }

    #[tokio::test(start_paused = true)]
    async fn test_impossible_rtc_date_still_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        let feb_31 = Timestamp::new(2024, 2, 31, 12, 0, 0);
        let clock = ClockAuthority::new(Box::new(SoftRtc::at(feb_31)), Box::new(SoftRtc::at(feb_31)));
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let mut h = harness(cfg, dir, clock, &net).await;

        let report = h.agent.cold_boot().await.unwrap();
        assert_eq!(report.time, TimeAcquired::Sentinel);
        assert!(report.record.is_some());
        assert!(matches!(report.next, NextStep::PowerOff(ref d) if d.sleep_for == Duration::from_secs(900)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_restored_from_wake_hint() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        cfg.query_gateway_time = false;
        cfg.schedule.save_wakeup = true;
        let hint = Timestamp::new(2024, 1, 10, 17, 0, 0);
        NvStore::new(&cfg.nv_path)
            .save(&NvState {
                wake_hint: Some(hint.to_epoch().unwrap()),
                ..Default::default()
            })
            .unwrap();
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let mut h = harness(cfg, dir, dead_clock(), &net).await;

        let report = h.agent.resume_from_wake().await.unwrap();
        assert_eq!(report.time, TimeAcquired::WakeHint);
        assert_eq!(report.timestamp, hint);
        assert!(report.record.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_wake_goes_back_to_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.transmit = TransmitPolicy::Off;
        let armed = Timestamp::new(2024, 1, 10, 17, 0, 0);
        NvStore::new(&cfg.nv_path)
            .save(&NvState {
                wake_hint: Some(armed.to_epoch().unwrap()),
                ..Default::default()
            })
            .unwrap();
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let mut h = harness(cfg, dir, valid_clock(Timestamp::new(2024, 1, 10, 16, 0, 0)), &net).await;

        let report = h.agent.resume_from_wake().await.unwrap();
        assert!(report.record.is_none());
        assert!(h.store.lines().is_empty());
        assert!(matches!(report.next, NextStep::PowerOff(ref d) if d.at == armed && d.sleep_for == Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_ids_survive_power_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let nv_path = cfg.nv_path.clone();
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        let mut h = harness(cfg, dir, valid_clock(Timestamp::new(2024, 1, 10, 12, 0, 0)), &net).await;

        tokio_test::assert_ok!(h.agent.cold_boot().await);
        assert_eq!(NvStore::new(nv_path).load().next_packet_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_session_counts_echoes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let net = SimulatedRadioNetwork::new(ChannelConditions::default());
        fake_gateway(&net, Timestamp::new(2024, 1, 9, 9, 58, 5)).await;
        let mut h = harness(cfg, dir, valid_clock(Timestamp::new(2024, 1, 10, 12, 0, 0)), &net).await;

        let summary = h.agent.probe_session(3, Duration::from_secs(10)).await.unwrap();
        assert_eq!((summary.sent, summary.ok), (3, 3));
        assert_eq!(summary.outcomes[2].seq, 3);
        assert_eq!(h.agent.clock().current_time().ymd(), "2024-01-09");
    }
}
