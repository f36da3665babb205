//! Exponential backoff policy.
//!
//! Pure policy object: no clock is captured, the caller sleeps. Retry loops
//! call `reset()` when they hit a timeout-class error, because an
//! upstream-initiated timeout after sustained idle is expected behavior from
//! a long-poll relay and must not be punished with further delay.

use std::time::Duration;

const INITIAL: Duration = Duration::from_millis(500);
const MAX: Duration = Duration::from_secs(60);
const MULTIPLIER: f64 = 1.5;

#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self { current: INITIAL }
    }

    /// The delay to sleep now; advances the internal delay for the next call
    /// without exceeding the cap.
    pub fn next_duration(&mut self) -> Duration {
        let current = self.current;
        let next = current.mul_f64(MULTIPLIER);
        if next < MAX {
            self.current = next;
        }
        current
    }

    /// Restore the initial delay.
    pub fn reset(&mut self) {
        self.current = INITIAL;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_growing_sequence() {
        let mut b = ExponentialBackoff::new();
        assert_eq!(b.next_duration(), Duration::from_millis(500));
        assert_eq!(b.next_duration(), Duration::from_millis(750));
        assert_eq!(b.next_duration(), Duration::from_millis(1125));
    }

    #[test]
    fn never_exceeds_cap() {
        let mut b = ExponentialBackoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..50 {
            last = b.next_duration();
            assert!(last <= Duration::from_secs(60));
        }
        // After enough advances the delay sits just below the cap and stops
        // growing.
        assert_eq!(last, b.next_duration());
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut b = ExponentialBackoff::new();
        for _ in 0..10 {
            b.next_duration();
        }
        b.reset();
        assert_eq!(b.next_duration(), Duration::from_millis(500));
    }
}
