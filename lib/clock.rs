//! Wall-clock indirection.
//!
//! Time-dependent logic (attribute TTLs, retry backoff) goes through the
//! [`Clock`] trait so tests can substitute a controllable clock instead of
//! sleeping for real.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Source of wall-clock time and delays.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Block the calling thread for `d`.
    fn sleep(&self, d: Duration);
}

/// The real thing.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// A manually-driven clock for tests.
///
/// `sleep` does not block: it advances the virtual time by the requested
/// duration and records it, so backoff sequences can be asserted exactly.
#[derive(Debug)]
pub struct MockClock {
    state: Mutex<MockState>,
}

#[derive(Debug)]
struct MockState {
    now: SystemTime,
    sleeps: Vec<Duration>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                now: SystemTime::UNIX_EPOCH,
                sleeps: Vec::new(),
            }),
        }
    }

    /// Advance the virtual time, as if `d` of wall time had elapsed.
    pub fn advance(&self, d: Duration) {
        let mut state = self.state.lock().expect("mock clock poisoned");
        state.now += d;
    }

    /// Every duration passed to `sleep` so far, in call order.
    #[must_use]
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.state.lock().expect("mock clock poisoned").sleeps.clone()
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        self.state.lock().expect("mock clock poisoned").now
    }

    fn sleep(&self, d: Duration) {
        let mut state = self.state.lock().expect("mock clock poisoned");
        state.now += d;
        state.sleeps.push(d);
    }
}
