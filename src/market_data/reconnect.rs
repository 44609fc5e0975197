use std::time::Duration;

/// Capped exponential backoff for the kline stream.
///
/// `next_delay` returns `None` once retries are disabled. A successful
/// connection calls `reset` so the next outage starts from `base_delay`.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,

    attempt: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(true, Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl ReconnectPolicy {
    pub fn new(enabled: bool, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            enabled,
            base_delay,
            max_delay,
            attempt: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Duration::ZERO, Duration::ZERO)
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        // base * 2^attempt, capped.
        let pow = self.attempt.min(31);
        self.attempt = self.attempt.saturating_add(1);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        Some(Duration::from_millis(base_ms.saturating_mul(1u64 << pow).min(max_ms)))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
