//! Retry backoff policy.
//!
//! Retries are delayed by re-hiding the task's queue message, so the policy
//! is a pure function from base delay and attempt count to a visibility
//! delay in seconds.

/// Exponential backoff: `floor(base_delay * 2^attempts_count)`.
///
/// Saturates instead of overflowing so a runaway attempt counter degrades to
/// a very long delay rather than a panic.
pub fn retry_delay(base_delay: i64, attempts_count: u32) -> i64 {
    if base_delay <= 0 {
        return 0;
    }
    let factor = 2_i64.checked_pow(attempts_count).unwrap_or(i64::MAX);
    base_delay.saturating_mul(factor)
}
