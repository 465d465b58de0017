mod retry_timer;
mod time;

#[cfg(test)]
pub(crate) mod test_utils;

pub(crate) use retry_timer::RetryTimerHandle;
pub(crate) use retry_timer::TimerStartError;
pub use time::Clock;
pub use time::RealClock;

#[cfg(test)]
pub(crate) use time::{mocked_clock, MockClock, MockClockController};
