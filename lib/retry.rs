//! Retry policy with exponential backoff.
//!
//! A [`RetryPolicy`] is shared by every fault-tolerant layer in the
//! process. Each backend call that wants retry semantics starts an
//! [`Operation`] and loops on [`Operation::should_retry`], which owns the
//! decision *and* the backoff sleep.
//!
//! `max_attempts` and `max_delay` are atomics: the signal handler zeroes
//! them at shutdown so in-flight retry loops observe the change and bail
//! out promptly instead of sleeping toward a dead mount.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use rand::Rng as _;
use tracing::warn;

use crate::clock::Clock;

/// The golden-ratio growth factor for successive delays.
const DEFAULT_EXP_BASE: f64 = 1.618;

/// Shared retry configuration.
pub struct RetryPolicy {
    clock: Arc<dyn Clock>,
    max_attempts: AtomicU32,
    time_limit: Duration,
    min_delay: Duration,
    max_delay_nanos: AtomicU64,
    exp_base: f64,
    randomize: bool,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts.load(Ordering::Relaxed))
            .field("time_limit", &self.time_limit)
            .field("min_delay", &self.min_delay)
            .field("max_delay", &self.max_delay())
            .field("exp_base", &self.exp_base)
            .field("randomize", &self.randomize)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` counts *total* attempts, including
    /// the initial one.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        max_attempts: u32,
        time_limit: Duration,
        min_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            clock,
            max_attempts: AtomicU32::new(max_attempts),
            time_limit,
            min_delay,
            max_delay_nanos: AtomicU64::new(duration_to_nanos(max_delay)),
            exp_base: DEFAULT_EXP_BASE,
            randomize: true,
        }
    }

    /// A policy that disallows all retries.
    #[must_use]
    pub fn no_retry(clock: Arc<dyn Clock>) -> Self {
        Self::new(
            clock,
            1,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
        )
    }

    /// Turn delay randomization on or off (on by default).
    #[must_use]
    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Start a new retry context for a single logical operation.
    #[must_use]
    pub fn start_operation(&self) -> Operation<'_> {
        Operation {
            policy: self,
            attempt: 1,
            deadline: self.clock.now() + self.time_limit,
            last_delay: Duration::ZERO,
        }
    }

    /// Disallow further retries process-wide. Called at shutdown so that
    /// in-flight operations stop sleeping and return their last error.
    pub fn disable(&self) {
        self.max_attempts.store(0, Ordering::Relaxed);
        self.max_delay_nanos.store(0, Ordering::Relaxed);
    }

    fn max_delay(&self) -> Duration {
        Duration::from_nanos(self.max_delay_nanos.load(Ordering::Relaxed))
    }
}

fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Per-call retry context handed out by [`RetryPolicy::start_operation`].
#[derive(Debug)]
pub struct Operation<'p> {
    policy: &'p RetryPolicy,
    attempt: u32,
    deadline: SystemTime,
    last_delay: Duration,
}

impl Operation<'_> {
    /// Decide whether the failed attempt described by `diag` should be
    /// retried. Sleeps for the backoff delay before returning `true`.
    pub fn should_retry(&mut self, diag: &str) -> bool {
        let max_attempts = self.policy.max_attempts.load(Ordering::Relaxed);
        if self.attempt >= max_attempts {
            warn!(
                attempt = self.attempt,
                "{diag}: will NOT be retried (reached max attempts)"
            );
            return false;
        }
        if self.policy.clock.now() > self.deadline {
            warn!(
                attempt = self.attempt,
                "{diag}: will NOT be retried (exceeded time limit)"
            );
            return false;
        }

        // First retry is immediate; the second costs one min_delay; after
        // that delays grow geometrically up to max_delay.
        let delay = match self.attempt {
            1 => Duration::ZERO,
            2 => self.policy.min_delay,
            _ => self
                .last_delay
                .mul_f64(self.policy.exp_base)
                .min(self.policy.max_delay()),
        };
        self.last_delay = delay;

        let effective = if self.policy.randomize && delay > self.policy.min_delay {
            let min = duration_to_nanos(self.policy.min_delay);
            let max = duration_to_nanos(delay);
            Duration::from_nanos(rand::thread_rng().gen_range(min..=max))
        } else {
            delay
        };

        warn!(
            attempt = self.attempt,
            delay_ms = effective.as_millis() as u64,
            "{diag}: retrying"
        );
        self.attempt += 1;
        self.policy.clock.sleep(effective);
        true
    }
}
