use std::time::Duration;

/// `base * 2^attempt`, saturating instead of overflowing.
pub(crate) fn exponential(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}
