//! Monotonic time helpers used for throughput calculation

use std::time::Instant;

/// Source of monotonic timestamps
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall-clock independent system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Seconds elapsed from `earlier` to `later`, clamped at zero
pub fn seconds_between(later: Instant, earlier: Instant) -> f64 {
    later.saturating_duration_since(earlier).as_secs_f64()
}
