use core::future::Future;
use core::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::config::ServerConfig;
use crate::lorawan::phy::TimingParams;

/// Receive window opened by a Class A device after an uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiveWindow {
    Rx1 = 1,
    Rx2 = 2,
}

/// Where an uplink stands relative to its receive windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// A downlink can still make RX1
    BeforeRx1,
    /// RX1 is out of reach, RX2 is not
    BeforeRx2,
    /// Both windows are gone
    Missed,
}

/// Deadline bookkeeping for the receive windows of one uplink.
///
/// All checks are pure arithmetic on the elapsed time since the uplink's
/// radio arrival; nothing here blocks.
#[derive(Debug, Clone, Copy)]
pub struct WindowTimer {
    arrival: Instant,
    rx1_delay: Duration,
    rx2_delay: Duration,
    expected_processing: Duration,
    min_cloud_check: Duration,
}

impl WindowTimer {
    /// Windows of a data uplink
    pub fn new(arrival: Instant, timing: &TimingParams, config: &ServerConfig) -> Self {
        Self {
            arrival,
            rx1_delay: timing.rx1_delay,
            rx2_delay: timing.rx2_delay,
            expected_processing: config.expected_processing_time(),
            min_cloud_check: config.min_cloud_check_time(),
        }
    }

    /// Windows of a join request
    pub fn for_join(arrival: Instant, timing: &TimingParams, config: &ServerConfig) -> Self {
        Self {
            rx1_delay: timing.join_accept_delay1,
            rx2_delay: timing.join_accept_delay2,
            ..Self::new(arrival, timing, config)
        }
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    /// Opening of a window, measured from arrival
    pub fn delay(&self, window: ReceiveWindow) -> Duration {
        match window {
            ReceiveWindow::Rx1 => self.rx1_delay,
            ReceiveWindow::Rx2 => self.rx2_delay,
        }
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.arrival)
    }

    /// Time until the window opens; `None` once it has
    pub fn remaining_time_for_window(&self, window: ReceiveWindow) -> Option<Duration> {
        self.remaining_at(window, self.elapsed())
    }

    pub fn remaining_at(&self, window: ReceiveWindow, elapsed: Duration) -> Option<Duration> {
        self.delay(window).checked_sub(elapsed)
    }

    /// A downlink packaged now still reaches the window
    pub fn in_time_for(&self, window: ReceiveWindow) -> bool {
        self.in_time_at(window, self.elapsed())
    }

    pub fn in_time_at(&self, window: ReceiveWindow, elapsed: Duration) -> bool {
        elapsed + self.expected_processing <= self.delay(window)
    }

    pub fn state_at(&self, elapsed: Duration) -> State {
        if self.in_time_at(ReceiveWindow::Rx1, elapsed) {
            State::BeforeRx1
        } else if self.in_time_at(ReceiveWindow::Rx2, elapsed) {
            State::BeforeRx2
        } else {
            State::Missed
        }
    }

    /// Window to send in, honoring a preference for RX2
    pub fn resolve_window_to_use(&self, preferred_window: u8) -> Option<ReceiveWindow> {
        self.resolve_window_at(preferred_window, self.elapsed())
    }

    pub fn resolve_window_at(&self, preferred_window: u8, elapsed: Duration) -> Option<ReceiveWindow> {
        if preferred_window != 2 && self.in_time_at(ReceiveWindow::Rx1, elapsed) {
            Some(ReceiveWindow::Rx1)
        } else if self.in_time_at(ReceiveWindow::Rx2, elapsed) {
            Some(ReceiveWindow::Rx2)
        } else {
            None
        }
    }

    /// Budget for looking up a cloud-to-device message; zero means skip it
    pub fn available_time_to_check_cloud_message(&self, preferred_window: u8) -> Duration {
        self.available_cloud_time_at(preferred_window, self.elapsed())
    }

    pub fn available_cloud_time_at(&self, preferred_window: u8, elapsed: Duration) -> Duration {
        let windows: &[ReceiveWindow] = if preferred_window == 2 {
            &[ReceiveWindow::Rx2]
        } else {
            &[ReceiveWindow::Rx1, ReceiveWindow::Rx2]
        };
        windows
            .iter()
            .filter_map(|w| self.remaining_at(*w, elapsed))
            .filter_map(|left| left.checked_sub(self.expected_processing))
            .find(|budget| *budget >= self.min_cloud_check)
            .unwrap_or(Duration::ZERO)
    }

    /// Last instant a downlink for `window` may be handed over
    pub fn deadline(&self, window: ReceiveWindow) -> Instant {
        let budget = self.delay(window).saturating_sub(self.expected_processing);
        self.arrival + budget
    }

    /// Run `work` unless the last window closes first
    pub async fn race<F: Future>(&self, work: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            output = work => Some(output),
            _ = sleep_until(self.deadline(ReceiveWindow::Rx2)) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> WindowTimer {
        WindowTimer::new(Instant::now(), &TimingParams::default(), &ServerConfig::default())
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn window_boundaries() {
        let t = timer();
        assert_eq!(t.resolve_window_at(1, ms(0)), Some(ReceiveWindow::Rx1));
        assert_eq!(t.resolve_window_at(1, ms(700)), Some(ReceiveWindow::Rx1));
        assert_eq!(t.resolve_window_at(1, ms(1001)), Some(ReceiveWindow::Rx2));
        assert_eq!(t.resolve_window_at(1, ms(1700)), Some(ReceiveWindow::Rx2));
        assert_eq!(t.resolve_window_at(1, ms(1801)), None);
        assert_eq!(t.state_at(ms(1801)), State::Missed);
    }

    #[test]
    fn rx2_preference() {
        let t = timer();
        assert_eq!(t.resolve_window_at(2, ms(0)), Some(ReceiveWindow::Rx2));
        assert_eq!(t.resolve_window_at(0, ms(0)), Some(ReceiveWindow::Rx1));
    }

    #[test]
    fn remaining_time() {
        let t = timer();
        assert_eq!(t.remaining_at(ReceiveWindow::Rx1, ms(400)), Some(ms(600)));
        assert_eq!(t.remaining_at(ReceiveWindow::Rx1, ms(1001)), None);
    }

    #[test]
    fn cloud_check_budget() {
        let t = timer();
        // 1000 - 300 - 100
        assert_eq!(t.available_cloud_time_at(1, ms(100)), ms(600));
        // RX1 leaves 150ms, below the 200ms minimum, so RX2 is used
        assert_eq!(t.available_cloud_time_at(1, ms(550)), ms(1150));
        assert_eq!(t.available_cloud_time_at(1, ms(1550)), Duration::ZERO);
    }

    #[test]
    fn join_windows() {
        let t = WindowTimer::for_join(Instant::now(), &TimingParams::default(), &ServerConfig::default());
        assert_eq!(t.resolve_window_at(1, ms(4000)), Some(ReceiveWindow::Rx1));
        assert_eq!(t.resolve_window_at(1, ms(4800)), Some(ReceiveWindow::Rx2));
        assert_eq!(t.resolve_window_at(1, ms(5701)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn race_gives_up_at_the_last_window() {
        let t = timer();
        let late = t.race(tokio::time::sleep(ms(5000))).await;
        assert_eq!(late, None);
        let quick = WindowTimer::new(Instant::now(), &TimingParams::default(), &ServerConfig::default())
            .race(async { 7 })
            .await;
        assert_eq!(quick, Some(7));
    }
}
