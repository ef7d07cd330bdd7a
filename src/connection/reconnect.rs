//! Exponential reconnect backoff.

use std::time::Duration;

use tracing::{error, warn};

/// Bounded exponential backoff between reconnect attempts.
///
/// The delay before attempt `n` (1-indexed) is
/// `min(base_delay * 2^(n-1), max_delay)`. No jitter is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the given attempt (1-indexed; 0 is treated as 1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = 1u32
            .checked_shl(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Drive attempts until one succeeds or the budget is spent.
    ///
    /// `attempts` is the persistent counter: it is incremented before every
    /// attempt and is left untouched on success (the caller resets it when
    /// the connection is established). `sleep` receives each backoff delay.
    pub(crate) fn run<S, C>(&self, attempts: &mut u32, mut sleep: S, mut connect: C) -> bool
    where
        S: FnMut(Duration),
        C: FnMut() -> bool,
    {
        while self.should_retry(*attempts) {
            *attempts += 1;
            let delay = self.delay_for_attempt(*attempts);
            warn!(
                attempt = *attempts,
                max_attempts = self.max_attempts,
                ?delay,
                "reconnecting"
            );
            sleep(delay);

            if connect() {
                return true;
            }
        }

        error!(
            max_attempts = self.max_attempts,
            "giving up after exhausting reconnect attempts"
        );
        false
    }
}
