//! Retry and backoff policy

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{LifecycleError, Result};

/// Upper bound on the exponent, keeps `powi` finite for absurd attempt numbers.
const MAX_EXPONENT: i32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// Error kinds a policy may treat as transient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryableKind {
    /// Connect, reset and request timeouts (and HTTP 408)
    TransientNetwork,
    /// HTTP 425 and 429
    Throttled,
    /// HTTP 5xx
    ServerError,
    /// 409 raised because another operation on the resource is in flight
    StillProvisioning,
}

impl RetryableKind {
    pub const ALL: [RetryableKind; 4] = [
        RetryableKind::TransientNetwork,
        RetryableKind::Throttled,
        RetryableKind::ServerError,
        RetryableKind::StillProvisioning,
    ];

    pub fn of(error: &LifecycleError) -> Option<Self> {
        match error {
            LifecycleError::TransientNetwork(_) => Some(RetryableKind::TransientNetwork),
            LifecycleError::Throttled { .. } => Some(RetryableKind::Throttled),
            LifecycleError::ServerError { .. } => Some(RetryableKind::ServerError),
            LifecycleError::StillProvisioning(_) => Some(RetryableKind::StillProvisioning),
            _ => None,
        }
    }
}

/// Retry configuration for remote calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of tries, including the first one
    pub max_attempts: u32,

    /// Delay after the first failed attempt, in milliseconds
    pub base_delay_ms: u64,

    /// Cap applied after jitter, in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,

    /// Delays are scaled by a random factor in `[1 - jitter, 1 + jitter]`
    pub jitter: f64,

    /// Error kinds that are retried; every other error fails at once
    pub retryable: Vec<RetryableKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: 0.2,
            retryable: RetryableKind::ALL.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = RetryableKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    fn attempts_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }

    fn jitter_fraction(&self) -> f64 {
        if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 0.99)
        } else {
            0.0
        }
    }

    pub fn classify(&self, error: &LifecycleError) -> ErrorClass {
        match RetryableKind::of(error) {
            Some(kind) if self.retryable.contains(&kind) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based), jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = self.jitter_fraction();
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        self.delay_with_factor(attempt, factor)
    }

    /// Deterministic form of [`Self::delay_for_attempt`].
    pub fn delay_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT as u32) as i32;
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let raw = self.base_delay().as_secs_f64() * multiplier.powi(exponent) * factor.max(0.0);
        let capped = raw.min(self.max_delay().as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Server hint when present, otherwise the computed delay.
    pub fn delay_for_error(&self, attempt: u32, error: &LifecycleError) -> Duration {
        match error {
            LifecycleError::Throttled {
                retry_after: Some(hint),
            } => *hint,
            _ => self.delay_for_attempt(attempt),
        }
    }

    /// Run `op` until it succeeds, fails fatally, or the attempt budget is spent.
    ///
    /// A transient error on the last allowed attempt is surfaced as
    /// [`LifecycleError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, clock: &dyn Clock, label: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_until(clock, label, None, op).await
    }

    /// [`Self::run`], but never sleeping past `deadline`.
    ///
    /// When the next retry delay would reach the deadline, waits out the
    /// remaining time and returns [`LifecycleError::RetriesExhausted`] with
    /// the last error.
    pub async fn run_until<T, F, Fut>(
        &self,
        clock: &dyn Clock,
        label: &str,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let budget = self.attempts_budget();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if self.classify(&error) == ErrorClass::Fatal {
                debug!("{} failed with fatal error: {}", label, error);
                return Err(error);
            }

            if attempt >= budget {
                warn!("{} failed after {} attempt(s): {}", label, attempt, error);
                return Err(LifecycleError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.delay_for_error(attempt, &error);
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(clock.now());
                if delay >= remaining {
                    warn!(
                        "{} hit transient error, deadline reached before next attempt: {}",
                        label, error
                    );
                    clock.sleep(remaining).await;
                    return Err(LifecycleError::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }
            }
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "{} hit transient error, retrying: {}",
                label,
                error
            );
            clock.sleep(delay).await;
        }
    }
}
