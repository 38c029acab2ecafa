//! Retry logic with exponential backoff

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Initial backoff duration
    #[serde(with = "crate::config::duration_millis")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "crate::config::duration_millis")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Backoff errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffError {
    #[error("Max retry attempts reached")]
    MaxAttemptsReached,

    #[error("Retry cancelled")]
    Cancelled,
}

/// Exponential backoff whose waits end early on cancellation
pub struct Backoff {
    config: RetryConfig,
    current_backoff: Duration,
    attempt: usize,
    cancel: CancellationToken,
}

impl Backoff {
    pub fn new(config: RetryConfig, cancel: CancellationToken) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
            cancel,
        }
    }

    /// Wait before next attempt
    pub async fn wait(&mut self) -> Result<(), BackoffError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(BackoffError::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {:?} before attempt {}",
            self.current_backoff, self.attempt
        );

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(BackoffError::Cancelled),
            _ = sleep(self.current_backoff) => {}
        }

        let next_secs = self.current_backoff.as_secs_f64() * self.config.multiplier;
        self.current_backoff = Duration::try_from_secs_f64(next_secs)
            .unwrap_or(self.config.max_backoff)
            .min(self.config.max_backoff);

        Ok(())
    }

    /// Reset backoff (call after a successful attempt)
    pub fn reset(&mut self) {
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: Option<usize>) -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(config(None), CancellationToken::new());

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_backoff(), Duration::from_millis(10));

        backoff.wait().await.unwrap();
        assert_eq!(backoff.current_backoff(), Duration::from_millis(20));

        backoff.wait().await.unwrap();
        backoff.wait().await.unwrap();
        assert_eq!(backoff.current_backoff(), Duration::from_millis(80));

        backoff.wait().await.unwrap();
        assert_eq!(backoff.attempt(), 4);
        // Should cap at max_backoff
        assert_eq!(backoff.current_backoff(), Duration::from_millis(100));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_backoff(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts() {
        let mut backoff = Backoff::new(config(Some(2)), CancellationToken::new());

        assert!(backoff.wait().await.is_ok());
        assert!(backoff.wait().await.is_ok());
        assert_eq!(backoff.wait().await, Err(BackoffError::MaxAttemptsReached));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_multiplier_caps_at_max() {
        for multiplier in [-1.0, 1e20, f64::NAN, f64::INFINITY] {
            let mut backoff = Backoff::new(
                RetryConfig {
                    multiplier,
                    ..config(None)
                },
                CancellationToken::new(),
            );

            backoff.wait().await.unwrap();
            assert_eq!(backoff.current_backoff(), Duration::from_millis(100));
            backoff.wait().await.unwrap();
            assert_eq!(backoff.current_backoff(), Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(
            RetryConfig {
                initial_backoff: Duration::from_secs(3600),
                ..RetryConfig::default()
            },
            cancel.clone(),
        );

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), backoff.wait()).await;
        assert_eq!(result.unwrap(), Err(BackoffError::Cancelled));
    }
}
