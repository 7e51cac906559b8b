//! Read-frame stage of the AO loop.
//!
//! [`CameraInput`] owns everything the stage needs across cycles: the resolved
//! streams, the scratch frame, the dark-subtract pool, the background
//! totalizer and the wait-time estimate. One call to
//! [`CameraInput::read_frame`] runs one cycle:
//!
//! ```text
//! wait -> snapshot -> dark subtract (imWFS0) -> totalize (imWFS0tot)
//!      -> normalize (imWFS1)
//! ```
//!
//! Everything is resolved lazily on the first call; element type and shape of
//! the source are then fixed for the lifetime of the instance.
//!
//! # Example
//! ```
//! use aol_stream::{DataType, ImageShape, PixelBuffer, StreamRegistry};
//! use aoloop_camin::camin::{CameraInput, FrameOutcome, FrameRequest};
//! use aoloop_camin::config::CameraInputConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = StreamRegistry::new();
//! let source = registry.create("aol1_wfsim", DataType::U16, ImageShape::new_2d(2, 2))?;
//!
//! let mut camin = CameraInput::new(CameraInputConfig::for_loop(1), registry.clone());
//! camin.initialize(false)?;
//! source.publish_frame(0, &PixelBuffer::U16(vec![1, 2, 3, 4]))?;
//! let outcome = camin.read_frame(FrameRequest::default())?;
//! assert!(matches!(outcome, FrameOutcome::Processed { total_flux, .. } if total_flux == 10.0));
//! # Ok(())
//! # }
//! ```

pub mod dark;
pub mod normalize;
pub mod snapshot;
pub mod timing;
pub mod total;
pub mod wait;

use crate::config::CameraInputConfig;
use crate::error::{AppResult, CaminError};
use aol_stream::{DataType, StreamImage, StreamRegistry};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};

pub use dark::{partition, subtract_inline, DarkSubtractPool};
pub use normalize::NormalizationCoefficients;
pub use snapshot::{resolve_slot, ScratchFrame};
pub use timing::{FrameProgress, LoopStage, LoopStatus, LoopTiming, TimingSlot, LOOP_TIMING_SLOTS};
pub use total::{masked_total, FluxTotalizer, SharedTotal, TotalStreams};
pub use wait::{FrameWaiter, WaitOutcome, WaitPolicy, WaitTimeEstimate};

/// Preferred source semaphore in normal operation.
pub const SEMAPHORE_INDEX: usize = 8;
/// Preferred source semaphore in response-matrix mode.
pub const SEMAPHORE_INDEX_RM: usize = 9;

/// Per-call flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameRequest {
    /// Response-matrix (calibration) mode: everything inline, no telemetry
    pub response_matrix: bool,
    /// Normalize by total flux
    pub normalize: bool,
    /// Discard pending source posts before waiting
    pub init_sem: bool,
}

/// What one [`CameraInput::read_frame`] call did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    /// A cycle ran and every enabled output was published.
    Processed {
        /// The bounded wait expired and the resident frame was reused
        timed_out: bool,
        /// Source ring slot that was read
        slot: u32,
        /// Source `cnt0` at snapshot time
        source_cnt0: u64,
        /// Source `cnt1` at snapshot time (pixel-stream slice)
        pixel_stream_slice: i64,
        /// Total flux used for normalization
        total_flux: f32,
        /// Normalization applied
        coefficients: NormalizationCoefficients,
    },
    /// Stop was requested during the wait; nothing was published.
    Stopped,
}

struct PipelineState {
    source: Arc<StreamImage>,
    waiter: FrameWaiter,
    scratch: ScratchFrame,
    dark: Option<Arc<StreamImage>>,
    totals: TotalStreams,
    imwfs1: Arc<StreamImage>,
    timing: LoopTiming,
    pool: Option<DarkSubtractPool>,
    totalizer: Option<FluxTotalizer>,
    total: Arc<SharedTotal>,
    total_initialized: bool,
    last_cnt0: u64,
    last_cnt0_rm: u64,
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        // Threads first: they hold clones of the streams.
        self.totalizer.take();
        self.pool.take();
        if let Some(index) = self.waiter.semaphore {
            self.source.release_semaphore(index);
        }
    }
}

/// Read-frame pipeline instance for one control loop.
pub struct CameraInput {
    config: CameraInputConfig,
    registry: StreamRegistry,
    state: Option<PipelineState>,
    estimate: WaitTimeEstimate,
    status: Arc<LoopStatus>,
    stop: Arc<AtomicBool>,
    coefficients: NormalizationCoefficients,
}

impl std::fmt::Debug for CameraInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraInput")
            .field("loop_index", &self.config.loop_index)
            .field("initialized", &self.state.is_some())
            .field("wait_estimate", &self.estimate)
            .finish_non_exhaustive()
    }
}

impl CameraInput {
    /// Create an uninitialized instance; streams are resolved on the first frame.
    #[must_use]
    pub fn new(config: CameraInputConfig, registry: StreamRegistry) -> Self {
        let estimate = WaitTimeEstimate::new(config.wait_estimate_samples);
        Self {
            config,
            registry,
            state: None,
            estimate,
            status: Arc::new(LoopStatus::default()),
            stop: Arc::new(AtomicBool::new(false)),
            coefficients: NormalizationCoefficients::identity(),
        }
    }

    /// Share an externally owned stop flag (e.g. raised by a signal handler).
    #[must_use]
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Static configuration.
    #[must_use]
    pub fn config(&self) -> &CameraInputConfig {
        &self.config
    }

    /// Stage status, shareable with monitors.
    #[must_use]
    pub fn status(&self) -> Arc<LoopStatus> {
        Arc::clone(&self.status)
    }

    /// Flag that makes a waiting [`read_frame`](Self::read_frame) return
    /// [`FrameOutcome::Stopped`].
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Running wait-time estimate.
    #[must_use]
    pub fn wait_estimate(&self) -> &WaitTimeEstimate {
        &self.estimate
    }

    /// Coefficients of the last normalization.
    #[must_use]
    pub fn coefficients(&self) -> NormalizationCoefficients {
        self.coefficients
    }

    /// True once the first frame has resolved the streams.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Number of dark-subtract workers running (0 when inline).
    #[must_use]
    pub fn dark_workers(&self) -> usize {
        self.state
            .as_ref()
            .and_then(|s| s.pool.as_ref())
            .map_or(0, DarkSubtractPool::len)
    }

    /// Background totalizer, if it has been started.
    #[must_use]
    pub fn totalizer(&self) -> Option<&FluxTotalizer> {
        self.state.as_ref().and_then(|s| s.totalizer.as_ref())
    }

    /// Latest total flux.
    #[must_use]
    pub fn total_flux(&self) -> f32 {
        self.state.as_ref().map_or(0.0, |s| s.total.get())
    }

    /// Stop and join the worker threads and release the source semaphore.
    ///
    /// The next [`read_frame`](Self::read_frame) re-initializes from scratch.
    pub fn shutdown(&mut self) {
        if self.state.take().is_some() {
            info!(loop_index = self.config.loop_index, "Camera input stopped");
        }
    }

    /// Resolve the streams and claim the source semaphore, if not done yet.
    ///
    /// Posts pending on the source at this point are discarded, so frames
    /// published before initialization are not seen as new.
    pub fn initialize(&mut self, response_matrix: bool) -> AppResult<()> {
        if self.state.is_none() {
            self.state = Some(initialize(&self.config, &self.registry, response_matrix)?);
        }
        Ok(())
    }

    /// Run one read-frame cycle.
    pub fn read_frame(&mut self, request: FrameRequest) -> AppResult<FrameOutcome> {
        let rm = request.response_matrix;
        let state = match self.state.take() {
            Some(state) => state,
            None => initialize(&self.config, &self.registry, rm)?,
        };
        let state = self.state.insert(state);
        let config = &self.config;
        let status = &self.status;

        if request.init_sem {
            let drained = state.waiter.reset(&state.source);
            info!(stream = state.source.name(), drained, "Reinitialized source semaphore");
        }

        // Wait
        if !rm {
            status.set_stage(LoopStage::WaitImage);
            state.timing.mark(TimingSlot::WaitImage, SystemTime::now())?;
        }
        let wait_start = Instant::now();
        let policy = self
            .estimate
            .policy(config.regulated_timing, config.regulated_timing_margin);
        let last_cnt0 = if rm { state.last_cnt0_rm } else { state.last_cnt0 };
        let waited = state.waiter.wait(&state.source, last_cnt0, policy, &self.stop);
        if waited == WaitOutcome::Stopped {
            return Ok(FrameOutcome::Stopped);
        }

        // Snapshot
        if !rm {
            status.set_stage(LoopStage::LoadImage);
        }
        status.set_progress(FrameProgress::Loaded);
        let slot = resolve_slot(&state.source)?;
        state.scratch.fill_from(&state.source, slot)?;
        let source_cnt0 = state.source.cnt0();
        if rm {
            state.last_cnt0_rm = source_cnt0;
        } else {
            state.last_cnt0 = source_cnt0;
        }
        let pixel_stream_slice = state.source.cnt1();

        // Dark subtract -> imWFS0
        if !rm {
            status.set_stage(LoopStage::DarkSubtract);
            state.timing.start_iteration(SystemTime::now())?;
        }
        let inline = config.loop_index == 0 || rm || config.dark_subtract_threads <= 1;
        if !inline && state.pool.is_none() {
            state.pool = Some(DarkSubtractPool::spawn(
                state.scratch.len(),
                config.dark_subtract_threads,
                &format!("aol{}-dark", config.loop_index),
            )?);
        }
        subtract_dark(state, if inline { None } else { state.pool.as_ref() })?;
        status.set_progress(FrameProgress::DarkSubtracted);

        // Totalize -> imWFS0tot
        if !rm {
            status.set_stage(LoopStage::ComputeTotal);
            state.timing.mark(TimingSlot::ComputeTotal, SystemTime::now())?;
        }
        if !config.total_async || !state.total_initialized || rm {
            let total = state.totals.compute()?;
            state.total.set(total);
            state.totals.publish(total)?;
            state.total_initialized = true;
        } else {
            if state.totalizer.is_none() {
                state.totalizer = Some(FluxTotalizer::spawn(
                    state.totals.clone(),
                    Arc::clone(&state.total),
                    config.total_trigger_cap,
                    &format!("aol{}-imtotal", config.loop_index),
                )?);
            }
            if let Some(totalizer) = state.totalizer.as_mut() {
                totalizer.trigger(&state.totals.imwfs0tot);
            }
        }
        let total_flux = state.total.get();

        // Normalize -> imWFS1
        if !rm {
            status.set_stage(LoopStage::Normalize);
            state.timing.mark(TimingSlot::Normalize, SystemTime::now())?;
        }
        let coefficients = if request.normalize {
            NormalizationCoefficients::from_total(total_flux, config.norm_floor, state.scratch.len())
        } else {
            NormalizationCoefficients::identity()
        };
        self.coefficients = coefficients;
        if !config.gpu_all || rm {
            normalize::publish_normalized(&state.totals.imwfs0, &state.imwfs1, coefficients.factor)?;
        }

        status.set_progress(FrameProgress::Done);
        if !rm {
            state.timing.mark(TimingSlot::Done, SystemTime::now())?;
        }

        let cycle = wait_start.elapsed();
        self.estimate.update(cycle.as_secs_f64());
        debug!(
            source_cnt0,
            slot,
            total_flux,
            factor = coefficients.factor,
            cycle_us = cycle.as_micros() as u64,
            timed_out = waited == WaitOutcome::TimedOut,
            "Frame processed"
        );

        Ok(FrameOutcome::Processed {
            timed_out: waited == WaitOutcome::TimedOut,
            slot,
            source_cnt0,
            pixel_stream_slice,
            total_flux,
            coefficients,
        })
    }
}

impl Drop for CameraInput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Dark-subtract the scratch frame into imWFS0 and publish it.
fn subtract_dark(state: &PipelineState, pool: Option<&DarkSubtractPool>) -> AppResult<()> {
    let imwfs0 = &state.totals.imwfs0;
    imwfs0.set_writing(true);
    let result = (|| -> AppResult<()> {
        let dark_guard = state.dark.as_ref().map(|d| d.read());
        let dark = match &dark_guard {
            Some(guard) => Some(guard.as_f32()?),
            None => None,
        };
        let mut out = imwfs0.write();
        let out = out.as_f32_mut()?;
        match pool {
            Some(pool) => pool.run(state.scratch.buffer(), dark, out),
            None => subtract_inline(state.scratch.buffer(), dark, out),
        }
    })();
    if let Err(e) = result {
        imwfs0.set_writing(false);
        return Err(e);
    }
    imwfs0.set_cnt1(state.timing.iteration());
    imwfs0.increment_cnt0();
    imwfs0.set_writing(false);
    imwfs0.post_all();
    Ok(())
}

/// Resolve and validate every stream the stage touches.
fn initialize(
    config: &CameraInputConfig,
    registry: &StreamRegistry,
    response_matrix: bool,
) -> AppResult<PipelineState> {
    let source = registry.open(&config.source_name())?;
    let shape = source.shape();
    let nelem = source.nelem();

    let dark = registry
        .get(&config.dark_name())
        .map(|dark| check_correction_frame(&dark, shape.size_x, shape.size_y).map(|()| dark))
        .transpose()?;
    let mask = registry
        .get(&config.mask_name())
        .map(|mask| check_correction_frame(&mask, shape.size_x, shape.size_y).map(|()| mask))
        .transpose()?;

    let imwfs0 = registry.load_or_create_2d(&config.imwfs0_name(), shape.size_x, shape.size_y, 0.0)?;
    let imwfs1 = registry.load_or_create_2d(&config.imwfs1_name(), shape.size_x, shape.size_y, 0.0)?;
    let imwfs0tot = registry.load_or_create_2d(&config.imwfs0tot_name(), 1, 1, 0.0)?;
    let looptiming =
        registry.load_or_create_2d(&config.looptiming_name(), LOOP_TIMING_SLOTS as u32, 1, 0.0)?;

    let semaphore = if source.semaphore_count() == 0 {
        None
    } else {
        let preferred = if response_matrix { SEMAPHORE_INDEX_RM } else { SEMAPHORE_INDEX };
        let index = source
            .claim_semaphore(preferred)
            .ok_or_else(|| CaminError::NoFreeSemaphore(source.name().to_string()))?;
        Some(index)
    };
    let waiter = FrameWaiter {
        semaphore,
        poll_interval: Duration::from_micros(config.poll_interval_us),
    };
    let drained = waiter.reset(&source);

    info!(
        loop_index = config.loop_index,
        stream = source.name(),
        datatype = %source.datatype(),
        size_x = shape.size_x,
        size_y = shape.size_y,
        depth = ?shape.depth,
        semaphore = ?semaphore,
        drained,
        dark = dark.is_some(),
        mask = mask.is_some(),
        "Camera input initialized"
    );

    Ok(PipelineState {
        scratch: ScratchFrame::new(source.datatype(), nelem),
        source,
        waiter,
        dark,
        totals: TotalStreams {
            imwfs0,
            mask,
            imwfs0tot,
            looptiming: Arc::clone(&looptiming),
        },
        imwfs1,
        timing: LoopTiming::new(looptiming),
        pool: None,
        totalizer: None,
        total: Arc::new(SharedTotal::default()),
        total_initialized: false,
        last_cnt0: 0,
        last_cnt0_rm: 0,
    })
}

/// Dark frames and masks must be float and frame-sized.
fn check_correction_frame(image: &StreamImage, size_x: u32, size_y: u32) -> AppResult<()> {
    if image.datatype() != DataType::F32 {
        return Err(CaminError::TypeMismatch {
            stream: image.name().to_string(),
            expected: DataType::F32,
            actual: image.datatype(),
        });
    }
    let shape = image.shape();
    if shape.size_x != size_x || shape.size_y != size_y {
        return Err(CaminError::ShapeMismatch {
            stream: image.name().to_string(),
            expected_x: size_x,
            expected_y: size_y,
            actual_x: shape.size_x,
            actual_y: shape.size_y,
        });
    }
    Ok(())
}
