/// Reconnect backoff for the realtime feed - exponential with full jitter
use rand::Rng;
use std::time::Duration;

pub struct ReconnectBackoff {
    /// Delay before the first retry
    min: Duration,
    /// Ceiling for any single delay
    max: Duration,
    /// Consecutive failed attempts since the last success
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempts: 0,
        }
    }

    /// Upper bound of the next delay, before jitter
    fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts.min(16)).unwrap_or(u32::MAX);
        self.min.saturating_mul(factor).min(self.max)
    }

    /// Record a failed attempt and return how long to wait before the next one
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempts = self.attempts.saturating_add(1);

        let floor_ms = self.min.as_millis() as u64;
        let ceiling_ms = (ceiling.as_millis() as u64).max(floor_ms);
        let jittered = rand::thread_rng().gen_range(floor_ms..=ceiling_ms);
        Duration::from_millis(jittered)
    }

    /// Connection came back; start over from the minimum delay
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
