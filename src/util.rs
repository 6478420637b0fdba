use std::time::{Duration, Instant};

/// A monotonic interval timer.
///
/// Started with an interval, it reports expiration once the interval has
/// elapsed. Resetting restarts the same interval from now.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timer {
    started: Instant,
    interval: Duration,
}

impl Timer {
    /// Creates a timer that expires after `interval` from now.
    pub(crate) fn new(interval: Duration) -> Self {
        Self { started: Instant::now(), interval }
    }

    /// Creates a timer that is already expired.
    pub(crate) fn expired() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Restarts the timer with a new interval.
    pub(crate) fn start(&mut self, interval: Duration) {
        self.started = Instant::now();
        self.interval = interval;
    }

    /// Restarts the timer with its current interval.
    pub(crate) fn reset(&mut self) {
        self.started = Instant::now();
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.started.elapsed() >= self.interval
    }

    /// Time left until expiration, zero if already expired.
    pub(crate) fn remaining(&self) -> Duration {
        self.interval.saturating_sub(self.started.elapsed())
    }

    /// Time elapsed since the last (re)start.
    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }
}

/// Allocator for small integer handles.
///
/// Hands out sequential non-negative values, wrapping around and skipping
/// values still in use.
#[derive(Debug, Default)]
pub(crate) struct HandleAllocator {
    next: i32,
}

impl HandleAllocator {
    pub(crate) fn next_handle(&mut self, in_use: impl Fn(i32) -> bool) -> i32 {
        loop {
            let handle = self.next;
            self.next = if self.next == i32::MAX { 0 } else { self.next + 1 };
            if !in_use(handle) {
                return handle;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_expires_after_interval() {
        let timer = Timer::new(Duration::from_millis(5));
        assert!(!timer.is_expired());
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.is_expired());
    }

    #[test]
    fn expired_timer_starts_expired() {
        assert!(Timer::expired().is_expired());
    }

    #[test]
    fn handles_skip_in_use_values() {
        let mut alloc = HandleAllocator::default();
        assert_eq!(alloc.next_handle(|_| false), 0);
        assert_eq!(alloc.next_handle(|h| h == 1), 2);
    }
}
