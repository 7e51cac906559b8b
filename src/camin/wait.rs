//! Frame wait strategy and the adaptive wait-time estimate.
//!
//! The driver blocks on its claimed source semaphore (or polls `cnt0` when the
//! source has none). Once the estimate has seen enough cycles and regulated
//! timing is on, the wait is bounded by `estimate * margin`; a late frame is
//! then skipped rather than waited for.

use aol_stream::StreamImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest uninterrupted block before the stop flag is checked again.
pub const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Running average of the per-cycle wait time.
///
/// The first `samples` updates accumulate `w / samples` (so the average
/// ramps up from zero); after that the average is an exponential moving
/// average with gain `1 / samples`.
#[derive(Debug, Clone)]
pub struct WaitTimeEstimate {
    average: f64,
    count: u64,
    samples: u64,
}

impl WaitTimeEstimate {
    /// Empty estimate with a bootstrap phase of `samples` updates (at least 1).
    #[must_use]
    pub fn new(samples: u64) -> Self {
        Self {
            average: 0.0,
            count: 0,
            samples: samples.max(1),
        }
    }

    /// Current estimate, seconds.
    #[must_use]
    pub fn average_secs(&self) -> f64 {
        self.average
    }

    /// Updates absorbed by the bootstrap phase so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// True once the bootstrap phase is over.
    #[must_use]
    pub fn is_bootstrapped(&self) -> bool {
        self.count >= self.samples
    }

    /// Fold one measured duration (seconds) into the estimate.
    pub fn update(&mut self, seconds: f64) {
        let n = self.samples as f64;
        if self.count < self.samples {
            self.average += seconds / n;
            self.count += 1;
        } else {
            let gain = 1.0 / n;
            self.average = self.average * (1.0 - gain) + gain * seconds;
        }
    }

    /// Wait policy for the next cycle.
    #[must_use]
    pub fn policy(&self, regulated: bool, margin: f64) -> WaitPolicy {
        if !(regulated && self.is_bootstrapped()) {
            return WaitPolicy::Blocking;
        }
        // A bound that is not a representable Duration means no bound.
        Duration::try_from_secs_f64(self.average * margin)
            .map_or(WaitPolicy::Blocking, WaitPolicy::Bounded)
    }
}

/// How long the driver may wait for the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Until a frame arrives
    Blocking,
    /// At most this long
    Bounded(Duration),
}

/// Result of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A new frame was signaled
    Frame,
    /// Bounded wait expired; the resident frame is used again
    TimedOut,
    /// Stop was requested while waiting
    Stopped,
}

/// Source-side wait parameters, fixed for one pipeline instance.
#[derive(Debug, Clone, Copy)]
pub struct FrameWaiter {
    /// Claimed semaphore, `None` when the source must be polled
    pub semaphore: Option<usize>,
    /// Sleep between `cnt0` polls
    pub poll_interval: Duration,
}

impl FrameWaiter {
    /// Discard pending posts on the claimed semaphore.
    pub fn reset(&self, source: &StreamImage) -> u32 {
        self.semaphore
            .and_then(|i| source.semaphore(i))
            .map_or(0, |sem| sem.drain())
    }

    /// Wait for the next frame of `source`.
    ///
    /// `last_cnt0` is the arrival counter of the previously processed frame;
    /// it is only used when polling.
    pub fn wait(
        &self,
        source: &StreamImage,
        last_cnt0: u64,
        policy: WaitPolicy,
        stop: &AtomicBool,
    ) -> WaitOutcome {
        let deadline = match policy {
            WaitPolicy::Blocking => None,
            WaitPolicy::Bounded(timeout) => Some(Instant::now() + timeout),
        };

        let outcome = match self.semaphore.and_then(|i| source.semaphore(i)) {
            Some(sem) => {
                let pending = sem.value();
                if pending > 1 {
                    warn!(stream = source.name(), pending, "Missed frame: semaphore already posted");
                }

                let outcome = loop {
                    let now = Instant::now();
                    let slice_end = match deadline {
                        Some(d) => d.min(now + STOP_CHECK_INTERVAL),
                        None => now + STOP_CHECK_INTERVAL,
                    };
                    if sem.wait_deadline(slice_end) {
                        break WaitOutcome::Frame;
                    }
                    if stop.load(Ordering::Acquire) {
                        break WaitOutcome::Stopped;
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        break WaitOutcome::TimedOut;
                    }
                };

                let drained = sem.drain();
                if drained > 0 {
                    debug!(stream = source.name(), drained, "Coalesced pending frame posts");
                }
                outcome
            }
            None => loop {
                if source.cnt0() != last_cnt0 {
                    break WaitOutcome::Frame;
                }
                if stop.load(Ordering::Acquire) {
                    break WaitOutcome::Stopped;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break WaitOutcome::TimedOut;
                }
                std::thread::sleep(self.poll_interval);
            },
        };

        if outcome == WaitOutcome::TimedOut {
            warn!(
                stream = source.name(),
                timeout_us = match policy {
                    WaitPolicy::Bounded(t) => t.as_micros() as u64,
                    WaitPolicy::Blocking => 0,
                },
                "Frame wait timed out, reusing resident frame"
            );
        }
        outcome
    }
}
