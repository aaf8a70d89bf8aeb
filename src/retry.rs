//! Backoff calculation shared by asset writes and catalog upserts.

use crate::config::RecoveryConfig;

/// Calculate retry delay with exponential backoff
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay)
/// jitter = random(0, delay/4)
/// final_delay = delay + jitter
/// ```
///
/// * `attempt` - Current retry attempt number (1-based, first retry = 1)
///
/// Returns delay in milliseconds before the next attempt.
pub fn calculate_retry_delay(attempt: u32, recovery: &RecoveryConfig) -> u64 {
    #[allow(clippy::cast_precision_loss)]
    let base_delay = recovery.base_retry_delay_ms as f64;

    #[allow(clippy::cast_precision_loss)]
    let exponential_delay = base_delay * 2.0_f64.powf(f64::from(attempt.saturating_sub(1)));

    #[allow(clippy::cast_precision_loss)]
    let delay = exponential_delay.min(recovery.max_retry_delay_ms as f64) as u64;

    // Jitter spreads concurrent retries against the same file or database
    let jitter_range = delay / 4;
    let jitter = if jitter_range == 0 {
        0
    } else {
        rand::random::<u64>() % jitter_range
    };
    delay + jitter
}
