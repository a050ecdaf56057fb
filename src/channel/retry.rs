//! # Retry Supervisor
//!
//! Wraps a fallible async operation in a fixed attempt budget with a constant
//! delay between attempts. Each attempt is announced on the status board.
//! Cancellation aborts both an in-flight attempt and the delay.

use crate::config::RetryConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::status::StatusBoard;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// `op` receives the 1-based attempt number. Returns
/// [`VoiceError::RetriesExhausted`] carrying the last error when every attempt
/// failed, or [`VoiceError::Cancelled`] as soon as `cancel` fires.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    status: &StatusBoard,
    cancel: &CancellationToken,
    mut op: F,
) -> VoiceResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = VoiceResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }
        status.set(
            format!("Connecting {} (attempt {}/{})", operation, attempt, max_attempts),
            None,
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
            result = op(attempt) => result,
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(VoiceError::Cancelled) => return Err(VoiceError::Cancelled),
            Err(e) => {
                warn!(operation, attempt, max_attempts, error = %e, "Attempt failed");
                last_error = e.to_string();
            }
        }

        if attempt < max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                _ = tokio::time::sleep(policy.delay) => {}
            }
        }
    }

    error!(operation, attempts = max_attempts, error = %last_error, "Giving up");
    Err(VoiceError::RetriesExhausted {
        operation: operation.to_string(),
        attempts: max_attempts,
        last_error,
    })
}
