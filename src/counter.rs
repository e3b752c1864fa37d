//! Shared completion counters for job groups.
//!
//! A counter is incremented once for every job created against it and
//! decremented exactly once when that job ends. Waiters treat zero as
//! "group complete". Counters are cheap to clone; every clone observes the
//! same underlying value.
//!
//! Ordering is acquire/release rather than sequentially consistent: the
//! worker that ends a job publishes with a release decrement, and waiters
//! observe with acquire loads — exactly the visibility the waiting queue's
//! zero check needs, and nothing stronger.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A thread-safe counter tracking outstanding jobs in a group.
#[derive(Clone, Default)]
pub struct Counter {
    inner: Arc<AtomicUsize>,
}

impl Counter {
    /// Creates a counter at zero; job creation raises it. A waiter on a
    /// counter that never tracked a job is picked up on the next tick's
    /// waiting pass.
    pub fn new() -> Self {
        Counter {
            inner: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a counter starting at `initial`, for groups whose size is
    /// known up front.
    pub fn with_value(initial: usize) -> Self {
        Counter {
            inner: Arc::new(AtomicUsize::new(initial)),
        }
    }

    /// Records one more outstanding job.
    pub fn increment(&self) {
        self.inner.fetch_add(1, Ordering::Release);
    }

    /// Records the end of one tracked job. Returns true when this was the
    /// group's last outstanding job.
    pub fn decrement(&self) -> bool {
        let previous = self.inner.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "counter decremented below zero");
        previous == 1
    }

    /// Number of jobs still outstanding.
    pub fn value(&self) -> usize {
        self.inner.load(Ordering::Acquire)
    }

    /// True when every tracked job has ended.
    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }

    /// Overwrites the value. Only meaningful while no job tracked by this
    /// counter is in flight.
    pub fn reset(&self, value: usize) {
        self.inner.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_arithmetic() {
        let counter = Counter::with_value(5);
        assert_eq!(counter.value(), 5);
        assert!(!counter.is_complete());

        counter.decrement();
        assert_eq!(counter.value(), 4);

        counter.increment();
        assert_eq!(counter.value(), 5);
    }

    #[test]
    fn decrement_reports_group_completion() {
        let counter = Counter::with_value(2);
        assert!(!counter.decrement());
        assert!(counter.decrement());
        assert!(counter.is_complete());
    }

    #[test]
    fn fresh_counter_is_already_complete() {
        let counter = Counter::new();
        assert!(counter.is_complete());

        counter.increment();
        assert!(!counter.is_complete());

        assert!(counter.decrement());
        assert!(counter.is_complete());
    }

    #[test]
    fn clones_share_state() {
        let counter = Counter::new();
        let clone = counter.clone();
        counter.increment();
        assert_eq!(clone.value(), 1);
        assert!(clone.decrement());
        assert!(counter.is_complete());
    }

    #[test]
    fn reset_overwrites() {
        let counter = Counter::with_value(10);
        counter.reset(5);
        assert_eq!(counter.value(), 5);
    }
}
