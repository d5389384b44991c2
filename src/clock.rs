//! Clock helpers on top of `mockable::Clock`

use chrono::{DateTime, Duration, Local, Utc};
use mockable::Clock;
use parking_lot::Mutex;
use std::sync::Arc;

/// Clock shared by long-lived components
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// The wall clock, shared
pub fn system_clock() -> SharedClock {
    Arc::new(mockable::DefaultClock)
}

/// A clock that only moves when told to. Useful for expiry and cache TTL tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for FixedClock {
    fn local(&self) -> DateTime<Local> {
        self.now.lock().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
