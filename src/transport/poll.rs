//! Adaptive polling intervals.
//!
//! Storage reads cost a transaction whether or not data arrived, so the read
//! loop backs off exponentially from a fast interval to a steady interval
//! while idle, and snaps back on any activity.

use std::time::Duration;

use crate::core::{DEFAULT_DATA_POLL, DEFAULT_FAST_POLL};

/// Exponential back-off sleeper between a fast and a steady interval.
///
/// After [`AdaptivePoll::reset`], the next tick is elided entirely so a
/// successful read never delays the immediately following poll.
#[derive(Debug)]
pub struct AdaptivePoll {
    current: Duration,
    fast: Duration,
    steady: Duration,
    skip_once: bool,
}

impl AdaptivePoll {
    /// Build a poller initialized to the fast interval.
    pub fn new(fast: Duration, steady: Duration) -> Self {
        let fast = if fast.is_zero() { DEFAULT_FAST_POLL } else { fast };
        let steady = if steady < fast { fast } else { steady };
        Self {
            current: fast,
            fast,
            steady,
            skip_once: false,
        }
    }

    /// Take the next wait interval and back off.
    ///
    /// Returns [`Duration::ZERO`] exactly once after a [`reset`]; otherwise
    /// returns the current interval and doubles it, clamped to steady.
    ///
    /// [`reset`]: AdaptivePoll::reset
    pub fn tick(&mut self) -> Duration {
        if self.skip_once {
            self.skip_once = false;
            return Duration::ZERO;
        }
        let interval = self.current;
        if self.current < self.steady {
            self.current = (self.current * 2).min(self.steady);
        }
        interval
    }

    /// Wait for the next interval.
    pub async fn sleep(&mut self) {
        let interval = self.tick();
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    /// Snap back to the fast interval and elide the next wait.
    pub fn reset(&mut self) {
        self.current = self.fast;
        self.skip_once = true;
    }

    /// The interval the next non-elided tick will wait for.
    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for AdaptivePoll {
    fn default() -> Self {
        Self::new(DEFAULT_FAST_POLL, DEFAULT_DATA_POLL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotone_and_clamped() {
        let mut poll = AdaptivePoll::new(Duration::from_millis(10), Duration::from_millis(70));

        let mut intervals = Vec::new();
        for _ in 0..5 {
            intervals.push(poll.tick());
        }
        assert_eq!(
            intervals,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(70),
                Duration::from_millis(70),
            ]
        );
    }

    #[test]
    fn test_reset_elides_one_tick() {
        let mut poll = AdaptivePoll::new(Duration::from_millis(10), Duration::from_millis(500));
        poll.tick();
        poll.tick();

        poll.reset();
        assert_eq!(poll.tick(), Duration::ZERO);
        assert_eq!(poll.tick(), Duration::from_millis(10));
    }

    #[test]
    fn test_zero_fast_uses_default() {
        let poll = AdaptivePoll::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(poll.current(), DEFAULT_FAST_POLL);
    }

    #[test]
    fn test_steady_below_fast_is_raised() {
        let mut poll = AdaptivePoll::new(Duration::from_millis(50), Duration::from_millis(5));
        assert_eq!(poll.tick(), Duration::from_millis(50));
        assert_eq!(poll.tick(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_advances_clock() {
        let mut poll = AdaptivePoll::new(Duration::from_millis(10), Duration::from_millis(40));
        let before = tokio::time::Instant::now();
        poll.sleep().await;
        poll.sleep().await;
        assert_eq!(before.elapsed(), Duration::from_millis(30));
    }
}
