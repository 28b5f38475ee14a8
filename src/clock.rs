/// Wall-clock access for the scheduler.
///
/// # Clock injection
/// The ingestion loop reads time only through `Clock`, never through
/// `Utc::now()` directly. Live runs use `SystemClock`; replay runs use a
/// `ReplayClock` that follows the recorded event timestamps, so a feed
/// captured hours ago still lands inside its settle windows.

use chrono::{DateTime, Utc};
use std::cell::Cell;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to, and only forward.
#[derive(Debug)]
pub struct ReplayClock {
    now: Cell<DateTime<Utc>>,
}

impl ReplayClock {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        ReplayClock { now: Cell::new(start) }
    }

    /// Moves to `time` unless the clock is already past it.
    pub fn advance_to(&self, time: DateTime<Utc>) {
        if time > self.now.get() {
            self.now.set(time);
        }
    }

    pub fn advance_by(&self, step: chrono::Duration) {
        let next = self.now.get().checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.advance_to(next);
    }
}

impl Clock for ReplayClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}
