//! Reconnection backoff policy.
//!
//! Pure functions of the attempt count: deterministic, no hidden state,
//! unit-testable in isolation. Delays double from one second and cap at
//! thirty; after five failed attempts the session stops retrying and is
//! surfaced to the user for a manual reconnect.

use std::time::Duration;

use crate::constants::{INITIAL_RETRY_DELAY, MAX_RECONNECT_ATTEMPTS, MAX_RETRY_DELAY};

/// Whether another automatic reconnection attempt is allowed.
pub fn should_retry(attempt: u32) -> bool {
    attempt < MAX_RECONNECT_ATTEMPTS
}

/// Backoff delay before reconnection attempt `attempt` (1-indexed).
///
/// `min(1s * 2^(attempt-1), 30s)`. Attempt 0 is clamped to 1.
pub fn next_delay(attempt: u32) -> Duration {
    // Exponent is capped well past the point where the cap takes over,
    // so the shift cannot overflow.
    let exp = attempt.max(1).saturating_sub(1).min(16);
    let delay = INITIAL_RETRY_DELAY * (1u32 << exp);
    delay.min(MAX_RETRY_DELAY)
}

/// Per-session reconnection bookkeeping.
///
/// Lives inside the connection state machine, never at module level, so
/// concurrent sessions cannot cross-talk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    /// Failed reopen attempts since the channel last reached connected.
    pub attempt: u32,
    /// Delay used for the most recently scheduled attempt.
    pub last_delay: Option<Duration>,
}

impl ReconnectState {
    /// Create a fresh state with no attempts recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more attempt and return the delay to wait before it,
    /// or `None` once the attempt budget is exhausted.
    pub fn schedule(&mut self) -> Option<Duration> {
        if !should_retry(self.attempt) {
            return None;
        }
        self.attempt += 1;
        let delay = next_delay(self.attempt);
        self.last_delay = Some(delay);
        Some(delay)
    }

    /// Reset after a successful connection or a manual reconnect.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
