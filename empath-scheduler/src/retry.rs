//! Retry schedule

use rand::Rng;

use crate::config::Policy;

/// Calculate the next wakeup of a deferred vertex
///
/// # Formula
/// `delay = interval * retries[index] + random(0..=skew)`
///
/// The index advances by one per retry and sticks at the last element of
/// the table, so the final multiplier repeats forever.
///
/// # Returns
/// The wakeup time and the index to use for the following retry
pub fn next_retry(policy: &Policy, index: usize, now: u64) -> (u64, usize) {
    let last = policy.retries.len().saturating_sub(1);
    let index = index.min(last);
    let factor = policy.retries.get(index).copied().unwrap_or(1);

    let jitter = if policy.skew > 0 {
        rand::rng().random_range(0..=policy.skew)
    } else {
        0
    };

    let delay = policy
        .interval
        .saturating_mul(u64::from(factor))
        .saturating_add(jitter);

    (now.saturating_add(delay), (index + 1).min(last))
}
