//! Simulated wavefront-sensor camera.
//!
//! Writes synthetic frames into a ring stream the way a camera driver would:
//! copy into the next slot, stamp `cnt1` with the slot, advance `cnt0`, post
//! every semaphore. Used by `aoloop-camin run --simulate` and by tests.

use crate::config::SimulationConfig;
use crate::error::{AppResult, CaminError};
use aol_stream::{DataType, ImageShape, PixelBuffer, StreamImage, StreamRegistry};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Inner {
    image: Arc<StreamImage>,
    config: SimulationConfig,
    frame_count: AtomicU64,
}

impl Inner {
    fn publish_next(&self) -> AppResult<u64> {
        let n = self.frame_count.fetch_add(1, Ordering::AcqRel) + 1;
        let depth = self.image.shape().depth.unwrap_or(1);
        let slot = (n % u64::from(depth)) as u32;
        let frame = synthetic_frame(&self.config, n);
        self.image.publish_frame(slot, &frame)?;
        Ok(n)
    }
}

/// Synthetic camera feeding one ring stream.
#[derive(Debug)]
pub struct SimulatedCamera {
    inner: Arc<Inner>,
    streaming: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedCamera {
    /// Create the ring stream `name` and a camera writing into it.
    pub fn new(registry: &StreamRegistry, name: &str, config: SimulationConfig) -> AppResult<Self> {
        let shape = ImageShape::new_ring(config.size_x, config.size_y, config.depth);
        let image = registry.create(name, config.datatype.into(), shape)?;
        info!(
            stream = name,
            size_x = config.size_x,
            size_y = config.size_y,
            depth = config.depth,
            period_us = config.frame_period_us,
            "Simulated camera created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                image,
                config,
                frame_count: AtomicU64::new(0),
            }),
            streaming: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    /// Stream the camera writes.
    #[must_use]
    pub fn image(&self) -> &Arc<StreamImage> {
        &self.inner.image
    }

    /// Frames published so far.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.inner.frame_count.load(Ordering::Acquire)
    }

    /// True while the background thread runs.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Publish one frame now. Returns the frame number.
    pub fn publish_next(&self) -> AppResult<u64> {
        self.inner.publish_next()
    }

    /// Dark frame matching the simulated background.
    #[must_use]
    pub fn dark_frame(&self) -> Vec<f32> {
        let c = &self.inner.config;
        vec![c.background; c.size_x as usize * c.size_y as usize]
    }

    /// Publish frames every `frame_period_us` on a background thread.
    pub fn start_stream(&mut self) -> AppResult<()> {
        if self.streaming.swap(true, Ordering::AcqRel) {
            return Err(CaminError::Configuration("simulated camera already streaming".into()));
        }

        let inner = Arc::clone(&self.inner);
        let streaming = Arc::clone(&self.streaming);
        let period = Duration::from_micros(self.inner.config.frame_period_us);
        let name = format!("sim-{}", self.inner.image.name());

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while streaming.load(Ordering::Acquire) {
                    if let Err(e) = inner.publish_next() {
                        warn!(error = %e, "Simulated camera failed, stopping");
                        break;
                    }
                    std::thread::sleep(period);
                }
                streaming.store(false, Ordering::Release);
                debug!(frames = inner.frame_count.load(Ordering::Acquire), "Simulated camera stopped");
            })
            .map_err(|source| {
                self.streaming.store(false, Ordering::Release);
                CaminError::ThreadSpawn { name, source }
            })?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Stop the background thread and wait for it.
    pub fn stop_stream(&mut self) {
        self.streaming.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Simulated camera thread panicked");
            }
        }
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

/// Frame `n`: background plus a Gaussian spot drifting around the centre.
#[must_use]
pub fn synthetic_frame(config: &SimulationConfig, n: u64) -> PixelBuffer {
    let (w, h) = (config.size_x as usize, config.size_y as usize);
    let phase = n as f32 * 0.05;
    let cx = (w as f32 - 1.0) / 2.0 + phase.cos() * w as f32 / 8.0;
    let cy = (h as f32 - 1.0) / 2.0 + phase.sin() * h as f32 / 8.0;
    let sigma2 = (w.min(h) as f32 / 6.0).max(0.5).powi(2);

    let values = (0..w * h).map(|i| {
        let dx = (i % w) as f32 - cx;
        let dy = (i / w) as f32 - cy;
        config.background + config.amplitude * (-(dx * dx + dy * dy) / (2.0 * sigma2)).exp()
    });

    match DataType::from(config.datatype) {
        DataType::U16 => PixelBuffer::U16(values.map(|v| v.round().clamp(0.0, f32::from(u16::MAX)) as u16).collect()),
        DataType::I16 => PixelBuffer::I16(
            values
                .map(|v| v.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16)
                .collect(),
        ),
        DataType::F32 => PixelBuffer::F32(values.collect()),
    }
}
