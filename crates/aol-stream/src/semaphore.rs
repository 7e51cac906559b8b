//! Counting semaphore with a saturation cap.
//!
//! Every stream carries a set of these, one per reader. The writer posts all of
//! them after each publish; each reader waits on the one it claimed. Posting is
//! capped at [`SEMAPHORE_MAXVAL`] so a stalled reader cannot make the count grow
//! without bound: once saturated, further posts are dropped.
//!
//! # Safety Model
//!
//! The count lives in a `parking_lot::Mutex` and waiters park on a `Condvar`.
//! The count never goes below zero (waits only decrement a positive count) and
//! never above the cap (posts at the cap are no-ops).

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Saturation value for stream semaphores.
pub const SEMAPHORE_MAXVAL: u32 = 10_000_000;

/// Counting semaphore bounded by a maximum value.
#[derive(Debug)]
pub struct StreamSemaphore {
    count: Mutex<u32>,
    available: Condvar,
    max: u32,
}

impl Default for StreamSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSemaphore {
    /// Create a semaphore at zero, saturating at [`SEMAPHORE_MAXVAL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_max(SEMAPHORE_MAXVAL)
    }

    /// Create a semaphore at zero with a custom cap (at least 1).
    #[must_use]
    pub fn with_max(max: u32) -> Self {
        Self {
            count: Mutex::new(0),
            available: Condvar::new(),
            max: max.max(1),
        }
    }

    /// Saturation cap.
    #[must_use]
    pub fn max_value(&self) -> u32 {
        self.max
    }

    /// Increment the count unless it is already at the cap.
    ///
    /// Returns `false` when the post was dropped because of saturation.
    pub fn post(&self) -> bool {
        let mut count = self.count.lock();
        if *count >= self.max {
            return false;
        }
        *count += 1;
        self.available.notify_one();
        true
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `true` if a post was consumed, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_deadline(Instant::now() + timeout)
    }

    /// Like [`wait`](Self::wait) but gives up at `deadline`.
    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count == 0 {
            if self.available.wait_until(&mut count, deadline).timed_out() {
                if *count == 0 {
                    return false;
                }
                break;
            }
        }
        *count -= 1;
        true
    }

    /// Decrement the count if positive, without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Current count (racy by nature; for diagnostics and coalescing decisions).
    #[must_use]
    pub fn value(&self) -> u32 {
        *self.count.lock()
    }

    /// Reset the count to zero, returning how many posts were discarded.
    pub fn drain(&self) -> u32 {
        let mut count = self.count.lock();
        std::mem::take(&mut *count)
    }
}
