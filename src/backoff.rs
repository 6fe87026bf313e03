use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter.
///
/// The k-th call (1-indexed) yields a delay sampled uniformly from
/// `[0, backoff_slot_size * 2^(k-1)]`, or `None` once `max_num_retries`
/// slots have been handed out. Exhaustion is sticky. Each logical call owns
/// its own generator; the type is deliberately not shared.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    max_num_retries: usize,
    backoff_slot_size: Duration,
    retries: usize,
}

impl ExponentialBackoff {
    pub(crate) fn new(max_num_retries: usize, backoff_slot_size: Duration) -> Self {
        Self {
            max_num_retries,
            backoff_slot_size,
            retries: 0,
        }
    }

    pub(crate) fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.max_num_retries {
            return None;
        }
        self.retries += 1;

        let capped_exponent = (self.retries - 1).min(31) as u32;
        let multiplier = 1_u64 << capped_exponent;
        let slot_ms = self.backoff_slot_size.as_millis().min(u64::MAX as u128) as u64;
        let upper_ms = slot_ms.saturating_mul(multiplier);
        let mut rng = rand::rng();
        Some(Duration::from_millis(rng.random_range(0..=upper_ms)))
    }

    pub(crate) fn retries_consumed(&self) -> usize {
        self.retries
    }
}
