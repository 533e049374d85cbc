//! Heartbeat monitor of one connection, with zombie connection detection.

use std::{future, time::Duration};

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// What to do on a heartbeat tick
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Beat {
    /// send a heartbeat now
    Send,
    /// too many heartbeats were not acknowledged, the connection is a zombie
    Zombie,
}

/// Heartbeat monitor.
///
/// Idle until [HeartbeatMonitor::arm] is called with the interval from the
/// hello payload. Every tick counts one missed ack, an ack resets the count.
/// Once the count exceeds the threshold the monitor reports [Beat::Zombie]
/// and disarms itself.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    max_missed_ack: u32,
    ticker: Option<Interval>,
    missed: u32,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
    response_time: Option<Duration>,
}

impl HeartbeatMonitor {
    /// Create a disarmed monitor
    pub fn new(max_missed_ack: u32) -> Self {
        Self {
            max_missed_ack,
            ticker: None,
            missed: 0,
            last_sent: None,
            last_ack: None,
            response_time: None,
        }
    }

    /// Start ticking every `interval`, the first tick fires immediately
    pub fn arm(&mut self, interval: Duration) {
        log::debug!("Heartbeat armed, interval {:?}", interval);

        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.ticker = Some(ticker);
        self.missed = 0;
    }

    /// Stop ticking
    pub fn disarm(&mut self) {
        if self.ticker.take().is_some() {
            log::debug!("Heartbeat disarmed");
        }
    }

    /// is the ticker running
    pub fn is_armed(&self) -> bool {
        self.ticker.is_some()
    }

    /// Wait for the next tick, pending forever when disarmed.
    ///
    /// Cancel safe, can be used in a `select!` loop.
    pub async fn tick(&mut self) -> Beat {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => future::pending::<()>().await,
        }

        self.missed += 1;

        if self.missed > self.max_missed_ack {
            log::warn!(
                "Heartbeat not acknowledged {} times, connection is a zombie",
                self.missed - 1
            );
            self.disarm();
            return Beat::Zombie;
        }

        self.last_sent = Some(Instant::now());
        log::trace!("Heartbeat tick, missed {}", self.missed - 1);

        Beat::Send
    }

    /// Record a heartbeat ack
    pub fn on_ack_received(&mut self) {
        let now = Instant::now();

        self.missed = 0;
        self.last_ack = Some(now);
        if let Some(sent) = self.last_sent {
            let rtt = now.saturating_duration_since(sent);
            log::trace!("Heartbeat acknowledged in {:?}", rtt);
            self.response_time = Some(rtt);
        }
    }

    /// Time between the last heartbeat and its ack
    pub fn response_time(&self) -> Option<Duration> {
        self.response_time
    }

    /// Heartbeats sent since the last ack
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Time of the last ack
    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }
}
