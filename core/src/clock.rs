//! Session-scoped time source. Everything in the engine that waits —
//! the `wait` command, the shell command timeout, the terminate grace
//! polling — takes its time from a [`Clock`] so tests can drive those waits
//! deterministically.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::sync::Notify;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time in seconds since the epoch.
    fn now(&self) -> f64;

    /// Block the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall time and real sleeps.
#[derive(Debug, Default)]
pub struct RealClock;

#[async_trait]
impl Clock for RealClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug)]
struct FakeClockState {
    now: f64,
    sleepers: usize,
}

/// A clock that advances only when [`FakeClock::advance`] is called. Sleepers
/// park until the clock has moved past their deadline, and
/// [`FakeClock::await_sleepers`] lets a test block until the expected number
/// of tasks are parked before advancing.
#[derive(Debug)]
pub struct FakeClock {
    state: Mutex<FakeClockState>,
    advanced: Notify,
    sleeper_change: Notify,
}

impl FakeClock {
    pub fn new(initial_time: f64) -> Self {
        Self {
            state: Mutex::new(FakeClockState {
                now: initial_time,
                sleepers: 0,
            }),
            advanced: Notify::new(),
            sleeper_change: Notify::new(),
        }
    }

    /// Move the clock forward, releasing any sleeper whose deadline is now
    /// covered.
    pub fn advance(&self, duration: Duration) {
        {
            let mut state = self.lock_state();
            state.now += duration.as_secs_f64();
        }
        self.advanced.notify_waiters();
    }

    /// Block until exactly `n` tasks are inside [`Clock::sleep`], or until
    /// `timeout` (real time) elapses. Returns whether the count was reached.
    pub async fn await_sleepers(&self, n: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.sleeper_change.notified();
                if self.lock_state().sleepers == n {
                    return;
                }
                changed.await;
            }
        })
        .await
        .is_ok()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FakeClockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> f64 {
        self.lock_state().now
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = {
            let mut state = self.lock_state();
            state.sleepers += 1;
            state.now + duration.as_secs_f64()
        };
        self.sleeper_change.notify_waiters();

        loop {
            // Register interest before re-checking so an advance between the
            // check and the await is not lost.
            let advanced = self.advanced.notified();
            if self.lock_state().now >= deadline {
                break;
            }
            advanced.await;
        }

        self.lock_state().sleepers -= 1;
        self.sleeper_change.notify_waiters();
    }
}

/// Convenience alias used across the engine.
pub type SharedClock = Arc<dyn Clock>;
