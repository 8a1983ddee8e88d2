//! Reconnection backoff for the streaming data source.

use std::time::{Duration, Instant};

use rand::{thread_rng, Rng};

/// Exponential backoff with jitter. The delay doubles on each consecutive failure up to `max`,
/// and resets to `base` once a connection has stayed up for `reset_interval`.
pub(crate) struct RetryDelay {
    base: Duration,
    max: Duration,
    reset_interval: Duration,
    current: Duration,
    good_since: Option<Instant>,
}

impl RetryDelay {
    pub const DEFAULT_MAX: Duration = Duration::from_secs(30);
    pub const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(base: Duration) -> Self {
        RetryDelay {
            base,
            max: RetryDelay::DEFAULT_MAX,
            reset_interval: RetryDelay::DEFAULT_RESET_INTERVAL,
            current: base,
            good_since: None,
        }
    }

    /// Mark the connection healthy as of `now`; used to decide whether backoff should reset.
    pub fn set_good_since(&mut self, now: Instant) {
        self.good_since.get_or_insert(now);
    }

    /// Compute the next reconnection delay.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        if let Some(good_since) = self.good_since.take() {
            if now.duration_since(good_since) >= self.reset_interval {
                self.current = self.base;
            }
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        jitter(delay)
    }
}

// Subtract up to 50% of the delay so that a fleet of clients does not reconnect in lockstep.
fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    delay - thread_rng().gen_range(Duration::ZERO..delay / 2)
}
