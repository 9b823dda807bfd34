//! Bounded restart policy
//!
//! A failed session is restarted only when its failure kind is retryable and
//! the session had reached audio. The wait grows linearly with the attempt
//! number. Thirty seconds of uninterrupted playback clear the history.

use std::time::Duration;

use crate::config::PlayerConfig;
use crate::error::ErrorKind;

/// What to do after a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    reset_after: Duration,
    attempt: u32,
    uninterrupted: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, reset_after: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            reset_after,
            attempt: 1,
            uninterrupted: Duration::ZERO,
        }
    }

    pub fn from_config(config: &PlayerConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_base_delay(),
            config.retry_reset_after(),
        )
    }

    /// Current attempt number, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decide on a failed session. `started_audio` is whether the session
    /// ever reached playback.
    pub fn on_failure(&mut self, kind: ErrorKind, started_audio: bool) -> RetryDecision {
        self.uninterrupted = Duration::ZERO;
        if !kind.is_retryable() || !started_audio || self.attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let decision = RetryDecision::RetryAfter {
            attempt: self.attempt,
            delay: self.base_delay * self.attempt,
        };
        self.attempt += 1;
        decision
    }

    /// Account uninterrupted playback. Returns true when this resets the
    /// attempt counter.
    pub fn on_playback_progress(&mut self, dt: Duration) -> bool {
        self.uninterrupted += dt;
        if self.uninterrupted >= self.reset_after && self.attempt > 1 {
            self.attempt = 1;
            return true;
        }
        false
    }

    /// Forget all history (manual play)
    pub fn reset(&mut self) {
        self.attempt = 1;
        self.uninterrupted = Duration::ZERO;
    }
}
