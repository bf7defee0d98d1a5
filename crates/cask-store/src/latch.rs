//! Count-down latch used to coordinate parallel startup work.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A latch that releases waiters once its count reaches zero.
///
/// The count never goes below zero; counting down an already-zero latch has
/// no effect, and `reset(0)` wakes current waiters just as reaching zero
/// does.
pub struct CountDownLatch {
    count: Mutex<u64>,
    cond: Condvar,
}

impl CountDownLatch {
    #[must_use]
    pub fn new(count: u64) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrement the count by one, waking all waiters if it reaches zero.
    pub fn count_down(&self) {
        self.count_down_by(1);
    }

    /// Decrement the count by `amount`, clamping at zero.
    pub fn count_down_by(&self, amount: u64) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count = count.saturating_sub(amount);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }

    /// Block until the count reaches zero or `timeout` elapses. Returns
    /// whether zero was reached.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Set the count to `count`, as if the latch were reconstructed. A reset
    /// to zero wakes any current waiters.
    pub fn reset(&self, count: u64) {
        let mut guard = self.count.lock();
        *guard = count;
        if *guard == 0 {
            self.cond.notify_all();
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counts_down_to_zero_and_stays() {
        let latch = CountDownLatch::new(2);
        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();
        assert_eq!(latch.count(), 0);
        latch.count_down();
        assert_eq!(latch.count(), 0, "count never goes below zero");
    }

    #[test]
    fn count_down_by_clamps() {
        let latch = CountDownLatch::new(3);
        latch.count_down_by(10);
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn wait_for_times_out_when_held() {
        let latch = CountDownLatch::new(1);
        assert!(!latch.wait_for(Duration::from_millis(20)));
        latch.count_down();
        assert!(latch.wait_for(Duration::from_millis(20)));
    }

    #[test]
    fn releases_waiters_across_threads() {
        let latch = Arc::new(CountDownLatch::new(4));
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        for _ in 0..4 {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.count_down());
        }
        waiter.join().unwrap();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn reset_to_zero_wakes_waiters() {
        let latch = Arc::new(CountDownLatch::new(1));
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        // Give the waiter a moment to block, then release it via reset.
        thread::sleep(Duration::from_millis(10));
        latch.reset(0);
        waiter.join().unwrap();
    }

    #[test]
    fn reset_rearms_the_latch() {
        let latch = CountDownLatch::new(0);
        assert!(latch.wait_for(Duration::from_millis(1)));
        latch.reset(2);
        assert!(!latch.wait_for(Duration::from_millis(10)));
        latch.count_down_by(2);
        latch.wait();
    }
}
