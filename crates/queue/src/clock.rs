//! Time source and single-alarm timer.

use factory_core::Time;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Callback run when an alarm fires.
pub type WakeCallback = Box<dyn FnOnce() + Send + 'static>;

/// A clock with one pending alarm.
///
/// Arming an alarm while another is pending keeps whichever is earlier.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Time;

    /// The time `interval` from now.
    fn after(&self, interval: Duration) -> Time {
        offset(self.now(), interval)
    }

    /// Run `callback` at `time` unless an earlier alarm is already pending.
    fn wake_at(&self, time: Time, callback: WakeCallback);

    /// Run `callback` after `interval`.
    fn wake_after(&self, interval: Duration, callback: WakeCallback) {
        self.wake_at(self.after(interval), callback)
    }

    /// Disarm the pending alarm, if any.
    fn cancel_wake(&self);
}

/// `time + interval`, saturating at the largest representable time.
pub fn offset(time: Time, interval: Duration) -> Time {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|d| time.checked_add_signed(d))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Alarm {
    target: Option<Time>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Wall clock backed by tokio timers.
#[derive(Default, Clone)]
pub struct SystemClock {
    alarm: Arc<Mutex<Alarm>>,
}

impl SystemClock {
    /// Create a clock with no alarm armed.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Time {
        chrono::Utc::now()
    }

    fn wake_at(&self, time: Time, callback: WakeCallback) {
        let mut alarm = lock(&self.alarm);
        if alarm.target.is_some_and(|pending| pending <= time) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("wake_at called outside a tokio runtime, alarm dropped");
            return;
        };
        if let Some(timer) = alarm.timer.take() {
            timer.abort();
        }
        alarm.generation += 1;
        alarm.target = Some(time);

        let generation = alarm.generation;
        let delay = (time - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let shared = Arc::clone(&self.alarm);
        alarm.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut alarm = lock(&shared);
                if alarm.generation != generation {
                    return;
                }
                alarm.target = None;
                alarm.timer = None;
            }
            callback();
        }));
    }

    fn cancel_wake(&self) {
        let mut alarm = lock(&self.alarm);
        if let Some(timer) = alarm.timer.take() {
            timer.abort();
        }
        alarm.generation += 1;
        alarm.target = None;
    }
}
