//! Time-driven work queue for Factory.
//!
//! A [`Queue`] dispatches records whose due time has arrived to a
//! [`Handler`], at most once per claim, and hands the handler a
//! [`JobControl`] through which it commits the record's next state.

#![warn(missing_docs)]

pub mod clock;
pub mod control;
pub mod error;
pub mod queue;
pub mod testing;

pub use clock::{Clock, SystemClock, WakeCallback};
pub use control::{JobControl, Logger, Reschedule};
pub use error::{QueueError, Result};
pub use queue::{Handler, Queue, QueueOptions};
pub use testing::FakeClock;
