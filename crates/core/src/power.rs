//! Hand-off to an external power controller

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::time::Timestamp;

/// The armed resumption point. Consumed when handed to a [`PowerBridge`] so
/// one deadline cannot be armed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct WakeDeadline {
    pub at: Timestamp,
    pub sleep_for: Duration,
}

impl WakeDeadline {
    pub fn new(at: Timestamp, sleep_for: Duration) -> Self {
        Self { at, sleep_for }
    }
}

#[async_trait]
pub trait PowerBridge: Send {
    /// Arms the wake alarm and asks the controller to cut power. Returns
    /// `false` when power is still on afterwards, in which case the caller
    /// has to fall back to its own sleep.
    async fn cut_power_until(&mut self, deadline: WakeDeadline) -> bool;
}

/// Digital output towards the power controller.
pub trait ControlLine: Send {
    fn set(&mut self, high: bool);
}

/// Alarm on the external RTC that re-enables power.
pub trait WakeAlarm: Send {
    fn arm(&mut self, at: Timestamp);
    fn disarm(&mut self);
}

/// Timer-controller bridge: arm the alarm, pulse DONE, wait for the cut.
pub struct DonePinBridge<L, A> {
    done: L,
    alarm: A,
    pulse: Duration,
    settle: Duration,
}

impl<L: ControlLine, A: WakeAlarm> DonePinBridge<L, A> {
    pub fn new(done: L, alarm: A) -> Self {
        Self {
            done,
            alarm,
            pulse: Duration::from_millis(1),
            settle: Duration::from_secs(2),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

#[async_trait]
impl<L: ControlLine, A: WakeAlarm> PowerBridge for DonePinBridge<L, A> {
    async fn cut_power_until(&mut self, deadline: WakeDeadline) -> bool {
        self.alarm.disarm();
        self.alarm.arm(deadline.at);
        info!("alarm armed for {}, signalling power off", deadline.at);

        self.done.set(true);
        tokio::time::sleep(self.pulse).await;
        self.done.set(false);

        // still running after the settle time means the controller ignored us
        tokio::time::sleep(self.settle).await;
        warn!("power still on {:?} after DONE pulse", self.settle);
        false
    }
}

/// Hosts with no power controller.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPowerControl;

#[async_trait]
impl PowerBridge for NoPowerControl {
    async fn cut_power_until(&mut self, deadline: WakeDeadline) -> bool {
        debug!("no power controller, wake at {} left to caller", deadline.at);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl ControlLine for Recorder {
        fn set(&mut self, high: bool) {
            self.0.lock().unwrap().push(format!("done={}", high));
        }
    }

    impl WakeAlarm for Recorder {
        fn arm(&mut self, at: Timestamp) {
            self.0.lock().unwrap().push(format!("arm {}", at));
        }
        fn disarm(&mut self) {
            self.0.lock().unwrap().push("disarm".to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_pin_sequence() {
        let log = Recorder::default();
        let mut bridge = DonePinBridge::new(log.clone(), log.clone());
        let at = Timestamp::new(2024, 1, 10, 17, 0, 0);

        let cut = bridge
            .cut_power_until(WakeDeadline::new(at, Duration::from_secs(600)))
            .await;

        assert!(!cut);
        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["disarm", "arm 2024-01-10T17:00:00", "done=true", "done=false"]
        );
    }

    #[tokio::test]
    async fn test_no_power_control_reports_still_on() {
        let at = Timestamp::new(2024, 1, 10, 17, 0, 0);
        assert!(!NoPowerControl.cut_power_until(WakeDeadline::new(at, Duration::ZERO)).await);
    }
}
