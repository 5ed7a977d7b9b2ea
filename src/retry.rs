//! Retry with exponential backoff for transient backend failures.

use crate::config::RetrySettings;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the initial attempt).
    /// None retries until the caller's stop condition fires.
    pub max_retries: Option<u32>,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0) to add randomness.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(settings.initial_ms),
            max_delay: Duration::from_millis(settings.max_ms),
            backoff_multiplier: settings.multiplier,
            jitter: settings.jitter.clamp(0.0, 1.0),
        }
    }
}

/// Retry policy that executes operations with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Calculate the delay for a given attempt (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt.min(30) as i32);

        let capped_delay = base_delay.min(self.config.max_delay.as_millis() as f64);

        let jittered_delay = if self.config.jitter > 0.0 {
            let jitter_range = capped_delay * self.config.jitter;
            let jitter_offset = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
            (capped_delay + jitter_offset).max(0.0)
        } else {
            capped_delay
        };

        Duration::from_millis(jittered_delay as u64)
    }

    /// Execute an operation, sleeping between failed attempts.
    ///
    /// `keep_going` is polled before every retry; returning false stops
    /// the loop and surfaces the last error (used for daemon shutdown).
    pub fn execute<T, F, K>(&self, mut operation: F, mut keep_going: K) -> anyhow::Result<T>
    where
        F: FnMut() -> anyhow::Result<T>,
        K: FnMut() -> bool,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation() {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let exhausted = self
                        .config
                        .max_retries
                        .map(|max| attempt >= max)
                        .unwrap_or(false);
                    if exhausted || !keep_going() {
                        return Err(e);
                    }
                    let delay = self.calculate_delay(attempt);
                    tracing::warn!(
                        "Attempt {} failed ({}); retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
