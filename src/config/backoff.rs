use std::time::Duration;

/// Configuration that determines how often the status of a resource is polled while waiting for
/// it to become ready. The `Default` impl will use an `initial_interval` of 2 seconds, a
/// `max_interval` of 30 seconds and a multiplier of 1.5. Polling never "gives up" on its own,
/// since each apply is bounded by the timeout for its kind. `BackoffConfig` implements `Default`,
/// so if you only need to customize a single field, you can use the following syntax:
///
/// ```rust
/// use kubestack::config::BackoffConfig;
/// use std::time::Duration;
///
/// let backoff_config = BackoffConfig {
///     max_interval: Duration::from_secs(60),
///     ..Default::default()
/// };
///
/// assert_eq!(Duration::from_secs(60), backoff_config.max_interval);
/// assert_eq!(Duration::from_secs(2), backoff_config.initial_interval);
/// assert_eq!(1.5, backoff_config.multiplier);
/// assert_eq!(0.5, backoff_config.randomization_factor);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// The delay before the first status poll. For each subsequent poll, this interval will be
    /// multiplied by the `multiplier` to determine the next delay, before applying the jitter.
    pub initial_interval: Duration,

    /// The maximum interval between two polls
    pub max_interval: Duration,

    /// The multiplier to apply to the interval after each poll that is still pending
    pub multiplier: f64,

    /// Applies a random jitter to each interval, to vary it by at most the given multiplier in
    /// either direction. This spreads out polls of resources that were all applied at about the
    /// same time.
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Polls at a fixed interval that will never increase or decrease. Randomization will be
    /// disabled as well, so that the interval is always the same.
    ///
    /// ```rust
    /// use kubestack::config::BackoffConfig;
    /// use backoff::backoff::Backoff;
    /// use std::time::Duration;
    ///
    /// let interval = Duration::from_millis(500);
    /// let mut backoff = BackoffConfig::fixed_interval(interval).new_backoff();
    ///
    /// for _ in 0..10 {
    ///     assert_eq!(Some(interval), backoff.next_backoff());
    /// }
    /// ```
    pub fn fixed_interval(interval: Duration) -> BackoffConfig {
        BackoffConfig {
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            randomization_factor: 0.0,
        }
    }

    /// Disables the jitter, so that every interval is exactly the configured one. Mostly useful
    /// for tests.
    pub fn disable_randomization(mut self) -> BackoffConfig {
        self.randomization_factor = 0.0;
        self
    }

    pub fn new_backoff(&self) -> ::backoff::ExponentialBackoff {
        ::backoff::ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            randomization_factor: self.randomization_factor,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}
