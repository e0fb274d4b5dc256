//! Backoff policy for language-model calls

use std::time::Duration;

use rand::Rng;

use crate::config::PresetConfig;

/// Base delay before the first retry
pub const BASE_DELAY: Duration = Duration::from_millis(500);

/// Retry policy for one upstream call
///
/// `max_retries` counts retries, not attempts: a policy with two retries
/// makes at most three attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for a preset: its retry count, capped by its timeout
    #[must_use]
    pub fn for_preset(preset: &PresetConfig) -> Self {
        Self {
            max_retries: preset.max_retries,
            base_delay: BASE_DELAY,
            max_delay: preset.timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: BASE_DELAY,
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Whether an HTTP status is worth retrying
#[must_use]
pub const fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429 | 500..=599)
}

/// Whether an error body carries a content-policy rejection
#[must_use]
pub fn is_content_policy(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("content_policy")
        || lower.contains("content_filter")
        || lower.contains("content policy")
        || lower.contains("safety system")
}

/// Compute the delay before the next retry attempt.
///
/// `min(base_delay * 2^attempt + jitter, max_delay)` with 0-25% jitter.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);

    let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..=0.25));

    (base + jitter).min(policy.max_delay)
}
