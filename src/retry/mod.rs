//! Bounded retry with exponential backoff, jitter, a wall-clock deadline and
//! cooperative cancellation.
//!
//! The engine never interprets errors itself. Each policy carries a classifier
//! deciding whether an error is worth another attempt; for the crate's own
//! [`Error`] that is [`Retryable::is_retryable`].
//!
//! ```ignore
//! use cluster_envcheck::retry::{self, RetryPolicy, RetryPreset};
//!
//! let policy = RetryPolicy::from_config(RetryPreset::Fast.config());
//! let outcome = retry::run(&policy, &cancel, "list_resources", || async {
//!     lister.list(&kinds, None).await
//! })
//! .await;
//! let raws = outcome.into_result("list_resources")?;
//! ```

mod presets;

pub use presets::RetryPreset;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Classification of errors into transient and permanent.
pub trait Retryable {
    /// Whether another attempt might succeed
    fn is_retryable(&self) -> bool;
}

/// Backoff parameters. A plain value, cheap to clone.
///
/// Durations are written in configuration as integer milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unlimited, deadline permitting)
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Upper bound on any single delay
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Wall-clock budget across all attempts and waits
    #[serde(
        rename = "deadline_ms",
        with = "option_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub deadline: Option<Duration>,
    /// Fraction of each delay that may be randomly shaved off, in [0, 1]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryPreset::Default.config()
    }
}

impl RetryConfig {
    /// Check the parameters for values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::config(format!(
                "retry multiplier must be >= 1, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::config(format!(
                "retry jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::config(format!(
                "retry base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if self.max_attempts == 0 && self.deadline.is_none() {
            return Err(Error::config(
                "retry config is unbounded: set max_attempts or deadline_ms",
            ));
        }
        Ok(())
    }

    /// Un-jittered delay after the given (1-based) failed attempt:
    /// `min(base_delay * multiplier^(attempt-1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// `delay_for(attempt)` scaled by a random factor in `[1 - jitter, 1]`.
    fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        // NaN would make the sampling range empty
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        delay.mul_f64(factor)
    }
}

/// A retry configuration plus the rule deciding which errors are transient.
pub struct RetryPolicy<E> {
    /// Backoff parameters
    pub config: RetryConfig,
    classifier: fn(&E) -> bool,
}

impl<E: Retryable> RetryPolicy<E> {
    /// Policy that retries whatever the error itself reports as retryable.
    pub fn from_config(config: RetryConfig) -> Self {
        Self {
            config,
            classifier: E::is_retryable,
        }
    }
}

impl<E> RetryPolicy<E> {
    /// Policy with a custom classifier.
    pub fn with_classifier(config: RetryConfig, classifier: fn(&E) -> bool) -> Self {
        Self { config, classifier }
    }

    /// Whether the policy would retry this error.
    pub fn is_retryable(&self, err: &E) -> bool {
        (self.classifier)(err)
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            classifier: self.classifier,
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Why the engine gave up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStop {
    /// The classifier rejected the error
    NonRetryable,
    /// `max_attempts` attempts all failed
    AttemptsExhausted,
    /// The deadline passed or would pass during the next wait
    DeadlineExceeded,
    /// The cancellation token fired
    Cancelled,
}

impl fmt::Display for RetryStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryStop::NonRetryable => "non-retryable",
            RetryStop::AttemptsExhausted => "attempts exhausted",
            RetryStop::DeadlineExceeded => "deadline exceeded",
            RetryStop::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of a retried operation, with attempt accounting.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// An attempt succeeded
    Success {
        /// Value returned by the successful attempt
        value: T,
        /// Attempts made, including the successful one
        attempts: u32,
        /// Total wall time
        elapsed: Duration,
    },
    /// The engine stopped without success
    Failure {
        /// Why it stopped
        reason: RetryStop,
        /// Last error seen; `None` only if cancelled before the first attempt
        last_error: Option<E>,
        /// Attempts made
        attempts: u32,
        /// Total wall time
        elapsed: Duration,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. } | RetryOutcome::Failure { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Total wall time
    pub fn elapsed(&self) -> Duration {
        match self {
            RetryOutcome::Success { elapsed, .. } | RetryOutcome::Failure { elapsed, .. } => {
                *elapsed
            }
        }
    }

    /// Whether an attempt succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }
}

impl<T> RetryOutcome<T, Error> {
    /// Convert into the crate result, wrapping failures in `RetriesExhausted`.
    pub fn into_result(self, operation: &str) -> Result<T> {
        match self {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Failure {
                reason,
                last_error,
                attempts,
                elapsed,
            } => Err(Error::RetriesExhausted {
                operation: operation.to_string(),
                reason,
                attempts,
                elapsed,
                last_error: last_error.map(Box::new),
            }),
        }
    }
}

/// Run `operation` under `policy` until it succeeds or the policy gives up.
///
/// The first attempt always runs unless `cancel` has already fired. An
/// attempt in flight is never interrupted; the deadline and the token are
/// consulted between attempts, and a backoff wait ends as soon as the token
/// fires.
pub async fn run<T, E, F, Fut>(
    policy: &RetryPolicy<E>,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: fmt::Display,
{
    let config = &policy.config;
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut last_error: Option<E> = None;

    loop {
        if cancel.is_cancelled() {
            warn!(operation = %operation_name, attempts, "Operation cancelled");
            return failure(RetryStop::Cancelled, last_error, attempts, start);
        }

        attempts += 1;
        let err = match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation = %operation_name, attempts, "Operation succeeded after retry");
                }
                return RetryOutcome::Success {
                    value,
                    attempts,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => e,
        };

        if !policy.is_retryable(&err) {
            error!(operation = %operation_name, attempt = attempts, error = %err, "Operation failed with non-retryable error");
            return failure(RetryStop::NonRetryable, Some(err), attempts, start);
        }

        if config.max_attempts > 0 && attempts >= config.max_attempts {
            error!(operation = %operation_name, attempt = attempts, error = %err, "Operation failed after max retries");
            return failure(RetryStop::AttemptsExhausted, Some(err), attempts, start);
        }

        let delay = config.jittered_delay(attempts);
        if let Some(deadline) = config.deadline {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() || remaining < delay {
                error!(
                    operation = %operation_name,
                    attempt = attempts,
                    error = %err,
                    remaining_ms = remaining.as_millis(),
                    "Operation deadline exceeded"
                );
                return failure(RetryStop::DeadlineExceeded, Some(err), attempts, start);
            }
        }

        warn!(
            operation = %operation_name,
            attempt = attempts,
            error = %err,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );
        last_error = Some(err);

        if cancel.is_cancelled() {
            return failure(RetryStop::Cancelled, last_error, attempts, start);
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(operation = %operation_name, attempts, "Operation cancelled during backoff");
                return failure(RetryStop::Cancelled, last_error, attempts, start);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn failure<T, E>(
    reason: RetryStop,
    last_error: Option<E>,
    attempts: u32,
    start: Instant,
) -> RetryOutcome<T, E> {
    RetryOutcome::Failure {
        reason,
        last_error,
        attempts,
        elapsed: start.elapsed(),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod option_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
