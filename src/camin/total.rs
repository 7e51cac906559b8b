//! Total flux of the dark-subtracted frame, inline or on a background thread.

use crate::error::{AppResult, CaminError};
use aol_stream::{StreamImage, StreamSemaphore};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::wait::STOP_CHECK_INTERVAL;

/// `Σ frame[i] * mask[i]`, or `Σ frame[i]` without a mask.
#[must_use]
pub fn masked_total(frame: &[f32], mask: Option<&[f32]>) -> f32 {
    match mask {
        Some(mask) => frame.iter().zip(mask).map(|(v, m)| v * m).sum(),
        None => frame.iter().sum(),
    }
}

/// Latest total flux, shared between the driver and the totalizer thread.
#[derive(Debug, Default)]
pub struct SharedTotal(AtomicU32);

impl SharedTotal {
    /// Current value.
    #[must_use]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Replace the value.
    pub fn set(&self, total: f32) {
        self.0.store(total.to_bits(), Ordering::Release);
    }
}

/// Streams the totalizer reads and writes.
#[derive(Debug, Clone)]
pub struct TotalStreams {
    /// Dark-subtracted frame
    pub imwfs0: Arc<StreamImage>,
    /// Optional flux mask
    pub mask: Option<Arc<StreamImage>>,
    /// Single-element total flux stream
    pub imwfs0tot: Arc<StreamImage>,
    /// Loop timing stream; its `cnt1` is the loop iteration
    pub looptiming: Arc<StreamImage>,
}

impl TotalStreams {
    /// Compute the total of the current `imWFS0` contents.
    pub fn compute(&self) -> AppResult<f32> {
        let frame = self.imwfs0.read();
        let frame = frame.as_f32()?;
        match &self.mask {
            Some(mask) => {
                let mask = mask.read();
                Ok(masked_total(frame, Some(mask.as_f32()?)))
            }
            None => Ok(masked_total(frame, None)),
        }
    }

    /// Write `total` into `imWFS0tot` under the writer protocol.
    pub fn publish(&self, total: f32) -> AppResult<()> {
        let out = &self.imwfs0tot;
        out.set_writing(true);
        let written = out.write().as_f32_mut().map(|v| {
            if let Some(first) = v.first_mut() {
                *first = total;
            }
        });
        if let Err(e) = written {
            out.set_writing(false);
            return Err(e.into());
        }
        out.increment_cnt0();
        out.set_cnt1(self.looptiming.cnt1());
        out.post_all();
        out.set_writing(false);
        Ok(())
    }
}

/// Persistent background totalizer.
///
/// The driver calls [`trigger`](Self::trigger) once per cycle; the thread
/// recomputes the total on each trigger and publishes it. Triggers coalesce
/// at the semaphore cap.
#[derive(Debug)]
pub struct FluxTotalizer {
    trigger: Arc<StreamSemaphore>,
    stop: Arc<AtomicBool>,
    computed: Arc<AtomicU64>,
    trigger_count: u64,
    thread: Option<JoinHandle<()>>,
}

impl FluxTotalizer {
    /// Start the totalizer thread.
    pub fn spawn(
        streams: TotalStreams,
        total: Arc<SharedTotal>,
        trigger_cap: u32,
        thread_name: &str,
    ) -> AppResult<Self> {
        let trigger = Arc::new(StreamSemaphore::with_max(trigger_cap));
        let stop = Arc::new(AtomicBool::new(false));
        let computed = Arc::new(AtomicU64::new(0));

        let thread = {
            let trigger = Arc::clone(&trigger);
            let stop = Arc::clone(&stop);
            let computed = Arc::clone(&computed);
            std::thread::Builder::new()
                .name(thread_name.to_string())
                .spawn(move || totalizer_loop(&streams, &total, &trigger, &stop, &computed))
                .map_err(|source| CaminError::ThreadSpawn {
                    name: thread_name.to_string(),
                    source,
                })?
        };

        info!(thread = thread_name, trigger_cap, "Flux totalizer started");
        Ok(Self {
            trigger,
            stop,
            computed,
            trigger_count: 0,
            thread: Some(thread),
        })
    }

    /// Request a recomputation without waiting for it.
    ///
    /// Stamps `imWFS0tot.cnt1` with the trigger count. Returns `false` when
    /// the request coalesced into an already pending one.
    pub fn trigger(&mut self, imwfs0tot: &StreamImage) -> bool {
        self.trigger_count += 1;
        imwfs0tot.set_cnt1(self.trigger_count as i64);
        let posted = self.trigger.post();
        if !posted {
            debug!(pending = self.trigger.value(), "Totalizer trigger coalesced");
        }
        posted
    }

    /// Triggers issued so far.
    #[must_use]
    pub fn trigger_count(&self) -> u64 {
        self.trigger_count
    }

    /// Triggers not yet picked up by the thread.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.trigger.value()
    }

    /// Pending-trigger cap.
    #[must_use]
    pub fn trigger_cap(&self) -> u32 {
        self.trigger.max_value()
    }

    /// Totals computed by the thread so far.
    #[must_use]
    pub fn computed(&self) -> u64 {
        self.computed.load(Ordering::Acquire)
    }
}

fn totalizer_loop(
    streams: &TotalStreams,
    total: &SharedTotal,
    trigger: &StreamSemaphore,
    stop: &AtomicBool,
    computed: &AtomicU64,
) {
    loop {
        let triggered = trigger.wait_timeout(STOP_CHECK_INTERVAL);
        if stop.load(Ordering::Acquire) {
            break;
        }
        if !triggered {
            continue;
        }
        let result = streams
            .compute()
            .and_then(|value| streams.publish(value).map(|()| value));
        match result {
            Ok(value) => {
                total.set(value);
                computed.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => {
                warn!(error = %e, "Flux totalizer failed, stopping");
                break;
            }
        }
    }
    debug!("Flux totalizer exiting");
}

impl Drop for FluxTotalizer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.trigger.post();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Flux totalizer panicked");
            }
        }
    }
}

/// Wait until the totalizer has computed at least `count` totals (tests, benches).
pub fn wait_for_computed(totalizer: &FluxTotalizer, count: u64, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while totalizer.computed() < count {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_micros(100));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use aol_stream::{ImageShape, PixelBuffer};

    fn image(name: &str, data: Vec<f32>) -> Arc<StreamImage> {
        let shape = ImageShape::new_2d(data.len() as u32, 1);
        Arc::new(StreamImage::with_data(name, shape, PixelBuffer::F32(data), 2).unwrap())
    }

    fn streams(frame: Vec<f32>, mask: Option<Vec<f32>>) -> TotalStreams {
        let looptiming = image("looptiming", vec![0.0; 35]);
        looptiming.set_cnt1(41);
        TotalStreams {
            imwfs0: image("imWFS0", frame),
            mask: mask.map(|m| image("mask", m)),
            imwfs0tot: image("imWFS0tot", vec![0.0]),
            looptiming,
        }
    }

    #[test]
    fn test_masked_total() {
        let frame = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(masked_total(&frame, None), 10.0);
        assert_eq!(masked_total(&frame, Some(&[1.0, 0.0, 1.0, 0.5])), 6.0);
        assert_eq!(masked_total(&frame, Some(&[1.0; 4])), masked_total(&frame, None));
    }

    #[test]
    fn test_publish_writes_total_stream() {
        let s = streams(vec![1.0, 2.0, 3.0], None);
        let total = s.compute().unwrap();
        s.publish(total).unwrap();
        assert_eq!(s.imwfs0tot.read().as_f32().unwrap()[0], 6.0);
        assert_eq!(s.imwfs0tot.cnt0(), 1);
        assert_eq!(s.imwfs0tot.cnt1(), 41);
        assert!(!s.imwfs0tot.is_writing());
        assert_eq!(s.imwfs0tot.semaphore(0).unwrap().value(), 1);
    }

    #[test]
    fn test_background_totalizer_publishes() {
        let s = streams(vec![2.0; 8], Some(vec![0.5; 8]));
        let shared = Arc::new(SharedTotal::default());
        let mut totalizer =
            FluxTotalizer::spawn(s.clone(), Arc::clone(&shared), 16, "test-imtotal").unwrap();

        assert!(totalizer.trigger(&s.imwfs0tot));
        assert_eq!(s.imwfs0tot.cnt1(), 1);
        assert!(wait_for_computed(&totalizer, 1, Duration::from_secs(5)));
        assert_eq!(shared.get(), 8.0);
        assert_eq!(s.imwfs0tot.read().as_f32().unwrap()[0], 8.0);
    }

    #[test]
    fn test_trigger_count_stays_within_cap() {
        let s = streams(vec![1.0; 4096], None);
        let shared = Arc::new(SharedTotal::default());
        let mut totalizer = FluxTotalizer::spawn(s.clone(), shared, 2, "test-imtotal").unwrap();
        for _ in 0..1000 {
            totalizer.trigger(&s.imwfs0tot);
            assert!(totalizer.pending() <= totalizer.trigger_cap());
        }
        assert_eq!(totalizer.trigger_count(), 1000);
        drop(totalizer);
    }
}
