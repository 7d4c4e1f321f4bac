// src/core/clock.rs

//! Time sources for the core loop.
//!
//! Liveness checks and job deadlines run against an injected `Clock` instead
//! of reading `Instant::now()` directly, so the timer sweep is deterministic
//! under test.

use parking_lot::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A monotonic + wall time source.
///
/// `monotonic()` is the time elapsed since the clock was created and is the
/// only time base used for liveness and deadlines. `wall()` is unix seconds,
/// used for event timestamps in serial forms.
pub trait Clock: Send + Sync {
    fn monotonic(&self) -> Duration;
    fn wall(&self) -> u64;
}

/// The production clock, backed by `Instant` and `SystemTime`.
#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }

    fn wall(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A hand-driven clock for tests. Both time bases advance together.
#[derive(Debug, Default)]
pub struct ManualClock {
    inner: Mutex<ManualInner>,
}

#[derive(Debug, Default)]
struct ManualInner {
    monotonic: Duration,
    wall: u64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the wall clock at the given unix second.
    pub fn starting_at(wall: u64) -> Self {
        Self {
            inner: Mutex::new(ManualInner { monotonic: Duration::ZERO, wall }),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.monotonic += by;
        inner.wall += by.as_secs();
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.inner.lock().monotonic
    }

    fn wall(&self) -> u64 {
        self.inner.lock().wall
    }
}
