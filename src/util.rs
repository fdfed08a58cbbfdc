//! Bounded spinning for loops over shared-memory words.

use std::hint;
use std::thread;

/// Bounds for spin loops on the lock word and the version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinConfig {
    /// Failed attempts between escalations. Writers check whether the lock
    /// holder is still alive, readers run a fix-versions pass.
    pub escalate_after: u32,
    /// Attempts that busy-spin before the default backoff starts yielding.
    pub early_spin_threshold: u32,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            escalate_after: 100,
            early_spin_threshold: 10,
        }
    }
}

/// How to wait between two failed attempts.
pub trait Backoff: Send + Sync {
    /// `attempt` counts failed attempts since the loop started, from 1.
    fn wait(&self, attempt: u32, config: &SpinConfig);
}

/// Exponential `spin_loop` for early attempts, then yield to the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpinBackoff;

impl Backoff for SpinBackoff {
    fn wait(&self, attempt: u32, config: &SpinConfig) {
        if attempt <= config.early_spin_threshold {
            for _ in 0..(1u32 << attempt.min(6)) {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
    }
}

/// Outcome of one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Backoff has run, try again.
    Retry,
    /// The bound was reached: do the expensive check, then try again.
    Escalate,
}

/// Retry loop state: counts attempts and decides between backoff and
/// escalation.
pub(crate) struct Spinner<'a> {
    config: SpinConfig,
    backoff: &'a dyn Backoff,
    attempts: u32,
}

impl<'a> Spinner<'a> {
    pub(crate) fn new(config: SpinConfig, backoff: &'a dyn Backoff) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt.
    pub(crate) fn spin(&mut self) -> Step {
        // Wraps so a loop stuck past u32::MAX attempts keeps escalating
        self.attempts = self.attempts.wrapping_add(1);
        if self.attempts % self.config.escalate_after.max(1) == 0 {
            Step::Escalate
        } else {
            self.backoff.wait(self.attempts, &self.config);
            Step::Retry
        }
    }
}
