use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Hands out strictly increasing UTC timestamps.
///
/// Wall-clock reads may repeat or step backwards; chat ordering relies on
/// timestamps being a total order, so every tick is at least one microsecond
/// after the previous one.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now();
        let mut guard = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = match *guard {
            Some(last) if wall <= last => last + Duration::microseconds(1),
            _ => wall,
        };
        *guard = Some(next);
        next
    }

    /// Advance past an externally observed timestamp (used when resuming from
    /// persisted records).
    pub fn observe(&self, seen: DateTime<Utc>) {
        let mut guard = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.map_or(true, |last| seen > last) {
            *guard = Some(seen);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_strictly_increase() {
        let clock = MonotonicClock::new();
        let mut previous = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn observe_moves_clock_forward() {
        let clock = MonotonicClock::new();
        let future = Utc::now() + Duration::hours(1);
        clock.observe(future);
        assert!(clock.now() > future);
    }
}
