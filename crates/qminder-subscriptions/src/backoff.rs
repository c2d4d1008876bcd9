//! Retry delay calculation.
//!
//! Two policies are used:
//!
//! - [`reconnect_delay`]: randomized exponential backoff for re-opening the
//!   subscription socket (base 1.2, clamped, plus 300..1000 ms of jitter).
//! - [`credential_retry_delay`]: plain doubling for the temporary key exchange.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryDelays;

const RECONNECT_BASE: f64 = 1.2;
const CREDENTIAL_BASE: f64 = 2.0;
const MIN_JITTER_MS: u64 = 300;
const MAX_JITTER_MS: u64 = 1000;

/// Calculate the delay before reconnect attempt `attempt` (0-indexed).
///
/// The result lies in `[clamp(1.2^n * 1000 ms), clamp(1.2^n * 1000 ms) + 1000 ms]`
/// where `clamp` bounds the value by `delays`.
pub fn reconnect_delay(attempt: u32, delays: &RetryDelays) -> Duration {
    let jitter = rand::thread_rng().gen_range(MIN_JITTER_MS..MAX_JITTER_MS);
    exponential(RECONNECT_BASE, attempt, delays) + Duration::from_millis(jitter)
}

/// Calculate the delay before retrying the temporary key exchange.
///
/// `clamp(2^n * 1000 ms)` without jitter.
pub fn credential_retry_delay(retry: u32, delays: &RetryDelays) -> Duration {
    exponential(CREDENTIAL_BASE, retry, delays)
}

fn exponential(base: f64, attempt: u32, delays: &RetryDelays) -> Duration {
    // Large exponents saturate to infinity, which the clamp absorbs.
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay_ms = base.powi(exponent) * 1000.0;
    let min_ms = delays.min_delay.as_millis() as f64;
    let max_ms = delays.max_delay.as_millis() as f64;
    Duration::from_millis(delay_ms.max(min_ms).min(max_ms) as u64)
}
