//! Wall-clock helpers.

use std::{
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

/// Current Unix time in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Strictly increasing millisecond clock.
///
/// Every call to [`MonotonicMillis::next`] returns a value greater than any
/// value it returned before, even when the wall clock has not advanced or
/// has stepped backwards.
#[derive(Debug, Default)]
pub struct MonotonicMillis {
    last: Mutex<i64>,
}

impl MonotonicMillis {
    /// Create a new clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp, never equal to a previously issued one.
    pub fn next(&self) -> i64 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let now = now_millis();
        let issued = if now > *last { now } else { *last + 1 };
        *last = issued;
        issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_repeats() {
        let clock = MonotonicMillis::new();
        let mut prev = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_monotonic_tracks_wall_clock() {
        let clock = MonotonicMillis::new();
        let before = now_millis();
        let issued = clock.next();
        assert!(issued >= before);
    }
}
