//! Resolver tuning.

use std::time::Duration;

use crate::error::{Error, Result};

/// Timing configuration shared by the sessions of a [`Builder`](crate::Builder).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tonic_k8s_resolver::ResolverConfig;
///
/// let config = ResolverConfig::default()
///     .backoff(Duration::from_millis(500), Duration::from_secs(10))
///     .resync_period(Duration::from_secs(300));
///
/// assert_eq!(config.initial_backoff, Duration::from_millis(500));
/// assert_eq!(config.max_backoff, Duration::from_secs(10));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverConfig {
    /// First wait before restarting a watch that ended.
    pub initial_backoff: Duration,

    /// Upper bound of the restart wait. Once doubling would pass it, the wait
    /// starts over from `initial_backoff`.
    pub max_backoff: Duration,

    /// How often a watching session re-reads the endpoints even without
    /// changes.
    pub resync_period: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            resync_period: Duration::from_secs(30 * 60),
        }
    }
}

impl ResolverConfig {
    /// Sets the restart backoff bounds.
    #[must_use]
    pub const fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Sets the periodic re-read interval.
    #[must_use]
    pub const fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Checks that the durations are usable.
    ///
    /// # Errors
    ///
    /// Fails if a duration is zero or `initial_backoff` exceeds `max_backoff`.
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(Error::InvalidConfig("initial_backoff must be non-zero".to_string()));
        }

        if self.initial_backoff > self.max_backoff {
            return Err(Error::InvalidConfig(
                "initial_backoff must not exceed max_backoff".to_string(),
            ));
        }

        if self.resync_period.is_zero() {
            return Err(Error::InvalidConfig("resync_period must be non-zero".to_string()));
        }

        Ok(())
    }
}
