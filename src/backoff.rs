//! Delay schedule for retrying a failed artifact fetch.
use std::time::Duration;

/// Doubling delays between attempts, capped at `max_delay`, for at most
/// `retries` extra attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    retries: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, retries: u32) -> Self {
        Self {
            delay: initial_delay.min(max_delay),
            max_delay,
            retries,
            attempt: 0,
        }
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    pub fn next_retry(&mut self) -> Option<Duration> {
        if self.attempt >= self.retries {
            return None;
        }
        self.attempt += 1;
        let delay = self.delay;
        self.delay = self.delay.saturating_mul(2).min(self.max_delay);
        Some(delay)
    }

    /// Retries handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 10);
        let delays: Vec<_> = std::iter::from_fn(|| b.next_retry()).take(5).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 5, 5].map(Duration::from_secs).to_vec()
        );
        assert_eq!(b.attempt(), 5);
    }

    #[test]
    fn test_budget_exhausted() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(30), 2);
        assert!(b.next_retry().is_some());
        assert!(b.next_retry().is_some());
        assert_eq!(b.next_retry(), None);
        assert_eq!(b.attempt(), 2);
    }

    #[test]
    fn test_no_retries() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0);
        assert_eq!(b.next_retry(), None);
    }

    #[test]
    fn test_initial_delay_clamped() {
        let mut b = Backoff::new(Duration::from_secs(90), Duration::from_secs(30), 1);
        assert_eq!(b.next_retry(), Some(Duration::from_secs(30)));
    }
}
