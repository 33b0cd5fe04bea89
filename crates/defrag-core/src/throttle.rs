/// Wall-clock throttle: inserts a delay between move calls so the fraction
/// of wall time actually spent moving data matches a configured speed
/// percentage (§4.8).
///
/// Grounded on `slow_down` (defrag_lib.cpp). The original reads the system
/// clock directly; this version takes "now" as a parameter so the state
/// machine itself is unit-testable without a real clock — the one caller
/// that matters (the phase sequencer's move loop) supplies
/// `Instant::now()`-derived millisecond timestamps.
use std::time::Duration;

/// Clamp applied to any single computed delay, matching the original's
/// hardcoded 30-second ceiling.
pub const MAX_DELAY_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    /// 1..=99 enables throttling; 0 or >=100 disables it (matches
    /// `speed_ <= 0 || speed_ >= 100` short-circuit).
    speed_percent: u8,
    start_time_ms: i64,
    last_checkpoint_ms: i64,
    running_time_ms: i64,
}

impl Throttle {
    /// `speed_percent` outside `1..=99` disables throttling entirely
    /// (`pause` always returns `Duration::ZERO`).
    pub fn new(speed_percent: u8, now_ms: i64) -> Self {
        Self {
            speed_percent,
            start_time_ms: now_ms,
            last_checkpoint_ms: now_ms,
            running_time_ms: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.speed_percent > 0 && self.speed_percent < 100
    }

    /// Compute (and internally account for) the delay that should be slept
    /// before the next unit of work, given the current wall-clock time.
    pub fn pause(&mut self, now_ms: i64) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }

        if now_ms > self.last_checkpoint_ms {
            self.running_time_ms += now_ms - self.last_checkpoint_ms;
        }
        if now_ms < self.start_time_ms {
            self.start_time_ms = now_ms;
        }

        let mut delay_ms = 0i64;
        if self.running_time_ms > 0 {
            let elapsed_wall = now_ms - self.start_time_ms;
            delay_ms = self.running_time_ms * 100 / self.speed_percent as i64 - elapsed_wall;
            delay_ms = delay_ms.clamp(0, MAX_DELAY_MS);
        }

        self.last_checkpoint_ms = now_ms;
        Duration::from_millis(delay_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_when_speed_is_zero_or_at_least_100() {
        let mut off = Throttle::new(0, 1000);
        assert!(!off.is_enabled());
        assert_eq!(off.pause(2000), Duration::ZERO);

        let mut full = Throttle::new(100, 1000);
        assert!(!full.is_enabled());
        assert_eq!(full.pause(2000), Duration::ZERO);
    }

    #[test]
    fn fifty_percent_speed_roughly_doubles_wall_time() {
        let mut t = Throttle::new(50, 0);
        // 100ms of "running" work happened between checkpoints.
        let delay = t.pause(100);
        // running_time=100, elapsed_wall=100-0=100, delay = 100*100/50 - 100 = 100
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn delay_is_clamped_to_thirty_seconds() {
        let mut t = Throttle::new(1, 0);
        let delay = t.pause(1000);
        assert_eq!(delay, Duration::from_millis(MAX_DELAY_MS as u64));
    }

    #[test]
    fn no_delay_when_wall_clock_already_matches_target_ratio() {
        let mut t = Throttle::new(50, 0);
        // First call establishes a baseline with no running time yet.
        assert_eq!(t.pause(0), Duration::ZERO);
        // Wall time then advances well beyond what 50% speed would need for
        // zero additional running time, so no further delay is owed.
        let delay = t.pause(500);
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn checkpoint_never_moves_backward_in_time() {
        let mut t = Throttle::new(50, 1000);
        // A clock that appears to go backward should not panic or
        // underflow running_time; the original silently ignores it via the
        // `now > last_checkpoint_` guard.
        let delay = t.pause(500);
        assert_eq!(delay, Duration::ZERO);
    }
}
