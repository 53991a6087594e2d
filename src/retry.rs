use tracing::warn;

/// Decision returned by the retry policy before each attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make another attempt (1-based attempt number).
    Retry { attempt: u32 },
    /// Attempts exhausted; escalate instead of trying again.
    GiveUp,
}

/// Bounded retry policy.
///
/// Used wherever an operation may be retried automatically but must never
/// loop indefinitely, most notably reaping a process group.
pub struct RetryPolicy {
    max_attempts: u32,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Claim the next attempt, or give up once `max_attempts` have been made.
    pub fn next_attempt(&mut self) -> RetryDecision {
        if self.current_attempt >= self.max_attempts {
            warn!(
                max_attempts = self.max_attempts,
                "retry attempts exhausted, giving up"
            );
            return RetryDecision::GiveUp;
        }
        self.current_attempt += 1;
        RetryDecision::Retry {
            attempt: self.current_attempt,
        }
    }

    /// Attempts made so far (0 = none yet).
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Exponential backoff: `initial * 2^consecutive`, capped at `max`.
pub fn backoff_delay(initial_ms: u64, consecutive: u32, max_ms: u64) -> u64 {
    let shift = 1u64.checked_shl(consecutive).unwrap_or(u64::MAX);
    let delay = initial_ms.saturating_mul(shift);
    delay.min(max_ms)
}
