//! Bounded retry policy
//!
//! Call sites that loop against flaky external services (mint quotes,
//! invoice fetches) share this one policy instead of carrying their own
//! inline attempt counters.

/// A fixed upper bound on attempts. Attempt numbers start at 1.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempt numbers `1..=max_attempts`.
    pub fn attempts(&self) -> impl Iterator<Item = u32> {
        1..=self.max_attempts
    }
}

/// Reduce `amount` by `percent`, using the same integer arithmetic as
/// payout sizing so repeated reductions are reproducible.
pub fn reduce_by_percent(amount: u64, percent: u64) -> u64 {
    amount.saturating_sub(amount * percent / 100)
}
