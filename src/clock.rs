//! Simulated wall clock
//!
//! The dashboard runs on an accelerated day: every tick advances the
//! simulated hour by one, wrapping at midnight.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::controller::TimerEvent;
use crate::models::HOURS_PER_DAY;

/// Hour-of-day counter for the selected device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationClock {
    hour: u8,
}

impl SimulationClock {
    pub fn starting_at(hour: u8) -> Self {
        Self {
            hour: hour % HOURS_PER_DAY as u8,
        }
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    /// Move to the next hour and return it
    pub fn advance(&mut self) -> u8 {
        self.hour = (self.hour + 1) % HOURS_PER_DAY as u8;
        self.hour
    }
}

/// Spawn the tick task for one selection. The first tick fires one period
/// after selection; the selection itself publishes the starting hour.
pub fn spawn_ticker(
    every: Duration,
    generation: u64,
    events: mpsc::UnboundedSender<TimerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if events.send(TimerEvent::Tick { generation }).is_err() {
                debug!(generation, "Controller gone, stopping simulation clock");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_wraps_at_midnight() {
        let mut clock = SimulationClock::starting_at(22);
        assert_eq!(clock.advance(), 23);
        assert_eq!(clock.advance(), 0);
        assert_eq!(clock.advance(), 1);
    }

    #[test]
    fn test_start_hour_is_normalized() {
        assert_eq!(SimulationClock::starting_at(30).hour(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_fires_once_per_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_ticker(Duration::from_millis(2000), 4, tx);

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(matches!(rx.try_recv(), Ok(TimerEvent::Tick { generation: 4 })));

        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        handle.abort();
    }
}
