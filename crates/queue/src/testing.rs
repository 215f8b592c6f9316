//! Deterministic clock for tests.

use crate::clock::{lock, offset, Clock, WakeCallback};
use factory_core::Time;
use std::sync::Mutex;
use std::time::Duration;

struct FakeState {
    now: Time,
    target: Option<Time>,
    callback: Option<WakeCallback>,
}

/// A clock that only moves when told to.
///
/// The alarm callback runs synchronously inside [`FakeClock::advance`] or
/// [`FakeClock::set_time`] once the time reaches the armed target.
pub struct FakeClock {
    state: Mutex<FakeState>,
}

impl FakeClock {
    /// Start the clock at `now`.
    pub fn new(now: Time) -> Self {
        Self {
            state: Mutex::new(FakeState {
                now,
                target: None,
                callback: None,
            }),
        }
    }

    /// Start the clock at `millis` after the epoch.
    pub fn at_millis(millis: i64) -> Self {
        Self::new(chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    /// Move time forward by `interval`.
    pub fn advance(&self, interval: Duration) {
        let target = offset(self.now(), interval);
        self.set_time(target);
    }

    /// Move time forward to `time`. Time never goes backwards.
    pub fn set_time(&self, time: Time) {
        let callback = {
            let mut state = lock(&self.state);
            state.now = state.now.max(time);
            match state.target {
                Some(target) if state.now >= target => {
                    state.target = None;
                    state.callback.take()
                }
                _ => None,
            }
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Current time in epoch milliseconds.
    pub fn millis(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// The armed alarm time.
    pub fn pending_wake(&self) -> Option<Time> {
        lock(&self.state).target
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Time {
        lock(&self.state).now
    }

    fn wake_at(&self, time: Time, callback: WakeCallback) {
        let mut state = lock(&self.state);
        if state.target.is_some_and(|pending| pending <= time) {
            return;
        }
        state.target = Some(time);
        state.callback = Some(callback);
    }

    fn cancel_wake(&self) {
        let mut state = lock(&self.state);
        state.target = None;
        state.callback = None;
    }
}
