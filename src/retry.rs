//! Retry policy for chat calls
//!
//! A call is retried when it produced a failed [`GenerationResult`] whose
//! failure is anything but missing configuration. Delays grow linearly
//! (`base_delay + step * attempt`, so 1s then 2s by default), are capped at
//! `max_delay` and can carry random jitter. Cancellation ends the wait
//! immediately.
//!
//! Between attempts the conversation rules are applied, so a failure that
//! invalidated the backend-side history retries with the full history while a
//! transient failure retries with the same continuation.
//!
//! # Examples
//!
//! ```rust
//! use llm_relay::retry::RetryConfig;
//! use std::time::Duration;
//!
//! let config = RetryConfig::default()
//!     .with_max_retries(4)
//!     .with_base_delay(Duration::from_millis(500));
//! assert_eq!(config.max_retries, 4);
//! ```

use crate::error::FailureKind;
use crate::session::{Conversation, SessionContext};
use crate::types::GenerationResult;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Added to the delay for each further retry
    pub delay_step: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Random jitter as a fraction of the delay (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            delay_step: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never retry.
    pub fn disabled() -> Self {
        Self::default().with_max_retries(0)
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_delay_step(mut self, step: Duration) -> Self {
        self.delay_step = step;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let linear = self.base_delay + self.delay_step.saturating_mul(attempt);
        let capped = linear.min(self.max_delay);
        if self.jitter_factor == 0.0 {
            return capped;
        }

        let capped_ms = capped.as_millis() as f64;
        let jitter_range = capped_ms * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range;
        let final_ms = capped_ms + jitter - (jitter_range / 2.0);
        Duration::from_millis(final_ms.max(0.0) as u64)
    }
}

/// Whether a failed result is worth another attempt.
pub fn is_retryable(result: &GenerationResult) -> bool {
    !result.success && result.failure != Some(FailureKind::ConfigurationMissing)
}

/// Sleep unless cancelled first.
pub async fn cancellable_sleep(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = sleep(delay) => Ok(()),
    }
}

/// Run `attempt` with retries, updating `conversation` after every outcome.
///
/// `attempt` receives the session to use for that try. Only cancellation
/// comes back as `Err`; otherwise the last result is returned.
pub async fn run_with_retry<F, Fut>(
    config: &RetryConfig,
    conversation: &mut Conversation,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<GenerationResult>
where
    F: FnMut(SessionContext) -> Fut,
    Fut: Future<Output = Result<GenerationResult>>,
{
    let mut tries = 0u32;
    loop {
        let result = attempt(conversation.session().clone()).await?;
        conversation.apply(&result);

        if !is_retryable(&result) || tries >= config.max_retries {
            return Ok(result);
        }

        let delay = config.delay_for(tries);
        tries += 1;
        warn!(
            attempt = tries,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = result.error.as_deref().unwrap_or("unknown"),
            continuing = conversation.session().is_continuing(),
            "Call failed, retrying"
        );
        cancellable_sleep(delay, cancel).await?;
    }
}
