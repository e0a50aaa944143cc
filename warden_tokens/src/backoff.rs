//! Error backoff handling
//!
//! Used to space out retries after a failed maintenance pass: the first
//! failure waits the initial delay, each consecutive failure multiplies it,
//! and a success resets it.

use std::time::Duration;

/// Configuration for how to manage backoff when an error is encountered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial error delay of 60 seconds with a multiplier of 2. Maximum delay is
    /// capped at 15 minutes, one default maintenance interval.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_secs(60),
            max_error_delay: Duration::from_secs(15 * 60),
            multiplier: 2,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// When encountering an error for the first time, the backoff will be `initial_error_delay`.
    /// On subsequent errors, the backoff should be multiplied by `multiplier`, with a cap of
    /// `max_error_delay`.
    pub fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_error_delay,
            max_error_delay: max_error_delay.max(initial_error_delay),
            multiplier: multiplier.max(1),
        }
    }

    /// Gets the delay applied after the first error
    #[inline]
    pub fn initial_error_delay(&self) -> Duration {
        self.initial_error_delay
    }

    /// Gets the upper bound on any delay
    #[inline]
    pub fn max_error_delay(&self) -> Duration {
        self.max_error_delay
    }
}

/// Utility trait for extending types with a backoff handler
pub trait WithBackoff {
    /// The output of providing backoff
    type Output;

    /// Applies backoff to the current value
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output;
}

impl<T, E> WithBackoff for Result<T, E> {
    type Output = Result<T, (E, Duration)>;
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// A stateful handler that manages error backoff state
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    last_delay: Option<Duration>,
    consecutive_errors: u32,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            last_delay: None,
            consecutive_errors: 0,
        }
    }

    /// Reports a success
    ///
    /// This resets the internal delay state.
    pub fn success(&mut self) {
        self.last_delay = None;
        self.consecutive_errors = 0;
    }

    /// Reports a failure and returns the expected backoff delay
    ///
    /// This will apply the values in the backoff configuration, increasing the backoff delay
    /// if required, and then report the expected next delay.
    pub fn error(&mut self) -> Duration {
        let new_delay = self
            .last_delay
            .map(|s| {
                s.checked_mul(self.config.multiplier)
                    .unwrap_or(self.config.max_error_delay)
                    .min(self.config.max_error_delay)
            })
            .unwrap_or(self.config.initial_error_delay);
        self.last_delay = Some(new_delay);
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        new_delay
    }

    /// The number of errors reported since the last success
    #[inline]
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}
