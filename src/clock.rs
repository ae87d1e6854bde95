use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// abstract time source (spec.md §6.1). every component that needs "now"
/// takes one by constructor injection rather than calling `Utc::now()`
/// directly, so tests can drive time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// production clock, backed by the system wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// deterministic test clock with an explicit `.advance()` step, modeled on
/// the teacher stack's time-control idiom used throughout its accrual and
/// waterfall tests.
pub struct TestClock {
    current: Mutex<DateTime<Utc>>,
}

impl TestClock {
    pub fn at(instant: DateTime<Utc>) -> Self {
        TestClock { current: Mutex::new(instant) }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut current = self.current.lock().expect("test clock mutex poisoned");
        *current = *current + duration;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.current.lock().expect("test clock mutex poisoned") = instant;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().expect("test clock mutex poisoned")
    }
}
