use std::time::Duration;

use rand::Rng;

/// Reconnect policy applied after an unexpected disconnect.
///
/// Reconnecting starts a new connection generation: requests that were in
/// flight have already failed, and subscriptions are not re-created.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Whether the driver reconnects on its own.
    pub enabled: bool,
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound for the delay between attempts.
    pub max_delay: Duration,
    /// Exponential growth factor of the delay.
    pub factor: f64,
    /// Random jitter factor (0.0-1.0).
    pub jitter: f64,
    /// Maximum number of consecutive failed attempts (None = infinite).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that reconnects with the default backoff.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Set the initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff factor.
    #[must_use]
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the jitter factor.
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the maximum number of attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub(crate) fn allows_attempt(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.is_none_or(|max| attempt < max)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay.is_zero() {
            return Err("Max reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

pub(crate) fn calculate_backoff(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let initial = policy.initial_delay.as_secs_f64();
    let max = policy.max_delay.as_secs_f64();
    let exponent = policy.factor.powf(f64::from(attempt));
    let base = (initial * exponent).min(max);

    if policy.jitter == 0.0 {
        return Duration::from_secs_f64(base);
    }

    let mut rng = rand::rng();
    let randomized = rng.random_range(0.0..=base);
    let blended = base * (1.0 - policy.jitter) + randomized * policy.jitter;
    Duration::from_secs_f64(blended)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculate_backoff_without_jitter_is_deterministic() {
        let policy = ReconnectPolicy::enabled()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(1000))
            .factor(2.0)
            .jitter(0.0);

        assert_eq!(calculate_backoff(&policy, 0), Duration::from_millis(100));
        assert_eq!(calculate_backoff(&policy, 1), Duration::from_millis(200));
        assert_eq!(calculate_backoff(&policy, 2), Duration::from_millis(400));
        assert_eq!(calculate_backoff(&policy, 3), Duration::from_millis(800));
        assert_eq!(calculate_backoff(&policy, 4), Duration::from_millis(1000));
    }

    #[test]
    fn calculate_backoff_with_jitter_stays_below_cap() {
        let policy = ReconnectPolicy::enabled()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(400))
            .jitter(0.5);

        for attempt in 0..8 {
            assert!(calculate_backoff(&policy, attempt) <= Duration::from_millis(400));
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = ReconnectPolicy::enabled().max_attempts(Some(2));
        assert!(policy.allows_attempt(0));
        assert!(policy.allows_attempt(1));
        assert!(!policy.allows_attempt(2));

        assert!(!ReconnectPolicy::disabled().allows_attempt(0));
        assert!(ReconnectPolicy::enabled().allows_attempt(u32::MAX - 1));
    }

    #[test]
    fn validate_rejects_bad_factor() {
        let policy = ReconnectPolicy::enabled().factor(0.5);
        assert_eq!(
            policy.validate().unwrap_err(),
            "Backoff factor must be >= 1.0"
        );
    }
}
