use serde::{Deserialize, Serialize};

/// Retry backoff strategies, all in milliseconds.
///
/// A job carrying one of these re-enters `delayed` after a failed attempt
/// instead of going straight back to `inactive`; the promoter returns it to
/// the runnable set once due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum BackoffStrategy {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, cap_ms: u64 },
    Linear { increment_ms: u64, cap_ms: u64 },
}

impl BackoffStrategy {
    /// Delay before the given attempt number (1-based: the first retry
    /// follows attempt 1).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        match self {
            BackoffStrategy::Fixed { delay_ms } => *delay_ms,
            BackoffStrategy::Exponential { base_ms, cap_ms } => base_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
                .min(*cap_ms),
            BackoffStrategy::Linear { increment_ms, cap_ms } => {
                increment_ms.saturating_mul(attempt as u64).min(*cap_ms)
            }
        }
    }
}
