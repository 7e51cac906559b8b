//! Loop timing telemetry and stage status.
//!
//! The timing stream holds seconds elapsed since the loop-iteration reference
//! time (its `atime`) at fixed checkpoints. The dark-subtract checkpoint also
//! moves the reference time, marking the start of a loop iteration.

use crate::error::AppResult;
use aol_stream::StreamImage;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Number of entries in the loop timing stream.
pub const LOOP_TIMING_SLOTS: usize = 35;

/// Checkpoints written by the read-frame stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TimingSlot {
    /// Start of dark subtraction (also the iteration reference)
    DarkSubtract = 0,
    /// Start of flux totalization
    ComputeTotal = 1,
    /// End of the read-frame stage
    Done = 2,
    /// Start of normalization
    Normalize = 14,
    /// Start of the frame wait
    WaitImage = 24,
}

/// Writer for the `looptiming` stream.
#[derive(Debug, Clone)]
pub struct LoopTiming {
    image: Arc<StreamImage>,
}

impl LoopTiming {
    /// Wrap a float stream of at least [`LOOP_TIMING_SLOTS`] elements.
    #[must_use]
    pub fn new(image: Arc<StreamImage>) -> Self {
        Self { image }
    }

    /// Underlying stream.
    #[must_use]
    pub fn image(&self) -> &Arc<StreamImage> {
        &self.image
    }

    /// Loop iteration counter maintained by the control loop.
    #[must_use]
    pub fn iteration(&self) -> i64 {
        self.image.cnt1()
    }

    /// Record `now` at `slot`.
    pub fn mark(&self, slot: TimingSlot, now: SystemTime) -> AppResult<()> {
        let elapsed = self.image.seconds_since_atime(now) as f32;
        let mut data = self.image.write();
        if let Some(entry) = data.as_f32_mut()?.get_mut(slot as usize) {
            *entry = elapsed;
        }
        Ok(())
    }

    /// Record the dark-subtract checkpoint and restart the iteration clock.
    pub fn start_iteration(&self, now: SystemTime) -> AppResult<()> {
        self.mark(TimingSlot::DarkSubtract, now)?;
        self.image.set_writing(true);
        self.image.set_atime(now);
        self.image.post_all();
        self.image.increment_cnt0();
        self.image.set_writing(false);
        Ok(())
    }
}

/// Stage the driver is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LoopStage {
    /// Copying the frame
    LoadImage = 0,
    /// Subtracting the dark frame
    DarkSubtract = 1,
    /// Totalizing flux
    ComputeTotal = 2,
    /// Normalizing
    Normalize = 3,
    /// Waiting for a frame
    WaitImage = 20,
}

/// Coarse progress through one read-frame call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameProgress {
    /// Frame copied to scratch
    Loaded = 0,
    /// Dark-subtracted frame published
    DarkSubtracted = 1,
    /// Stage complete
    Done = 2,
}

/// Stage status readable from monitoring threads.
#[derive(Debug, Default)]
pub struct LoopStatus {
    stage: AtomicU32,
    progress: AtomicU32,
}

impl LoopStatus {
    /// Set the current stage.
    pub fn set_stage(&self, stage: LoopStage) {
        self.stage.store(stage as u32, Ordering::Release);
    }

    /// Raw stage code.
    #[must_use]
    pub fn stage(&self) -> u32 {
        self.stage.load(Ordering::Acquire)
    }

    /// Set coarse progress.
    pub fn set_progress(&self, progress: FrameProgress) {
        self.progress.store(progress as u32, Ordering::Release);
    }

    /// Raw progress code.
    #[must_use]
    pub fn progress(&self) -> u32 {
        self.progress.load(Ordering::Acquire)
    }
}
