//! Dark subtraction, inline or on a persistent worker pool.
//!
//! `out[i] = float(raw[i]) - dark[i]`, or `float(raw[i])` when no dark frame
//! is loaded. Inline and pooled paths run the same kernel over the same index
//! ranges, so their output is bit-identical.
//!
//! # Pool protocol
//! ```text
//! driver:  for each worker: request_tx.send(job)      (capacity 1)
//!          for each worker, in order: done_rx.recv()
//! worker:  loop { job = request_rx.recv()?; subtract(range); done_tx.send(()) }
//! ```
//! Dropping the pool closes every request channel; workers see the
//! disconnect, exit, and are joined.

#![allow(unsafe_code)]

use crate::error::{AppResult, CaminError};
use aol_stream::PixelBuffer;
use std::ops::Range;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Sample types the kernel accepts.
trait Sample: Copy {
    fn to_f32(self) -> f32;
}

impl Sample for u16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f32::from(self)
    }
}

impl Sample for i16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f32::from(self)
    }
}

impl Sample for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

#[inline]
fn subtract_kernel<T: Sample>(raw: &[T], dark: Option<&[f32]>, out: &mut [f32]) {
    match dark {
        Some(dark) => {
            for ((o, &r), &d) in out.iter_mut().zip(raw).zip(dark) {
                *o = r.to_f32() - d;
            }
        }
        None => {
            for (o, &r) in out.iter_mut().zip(raw) {
                *o = r.to_f32();
            }
        }
    }
}

fn check_lengths(raw: &PixelBuffer, dark: Option<&[f32]>, out: &[f32]) -> AppResult<()> {
    let nelem = out.len();
    let mismatch = |what: &str, actual: usize| {
        CaminError::Configuration(format!(
            "dark subtraction {what} has {actual} samples, output has {nelem}"
        ))
    };
    if raw.len() != nelem {
        return Err(mismatch("input", raw.len()));
    }
    if let Some(dark) = dark {
        if dark.len() != nelem {
            return Err(mismatch("dark frame", dark.len()));
        }
    }
    Ok(())
}

/// Single-threaded dark subtraction over the whole frame.
pub fn subtract_inline(raw: &PixelBuffer, dark: Option<&[f32]>, out: &mut [f32]) -> AppResult<()> {
    check_lengths(raw, dark, out)?;
    match raw {
        PixelBuffer::U16(raw) => subtract_kernel(raw, dark, out),
        PixelBuffer::I16(raw) => subtract_kernel(raw, dark, out),
        PixelBuffer::F32(raw) => subtract_kernel(raw, dark, out),
    }
    Ok(())
}

/// Split `[0, nelem)` into `workers` contiguous ranges.
///
/// Every range has `nelem / workers` elements except the last, which also
/// takes the remainder.
#[must_use]
pub fn partition(nelem: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let chunk = nelem / workers;
    (0..workers)
        .map(|i| {
            let start = i * chunk;
            let end = if i + 1 == workers { nelem } else { start + chunk };
            start..end
        })
        .collect()
}

#[derive(Clone, Copy)]
enum RawPtr {
    U16(*const u16),
    I16(*const i16),
    F32(*const f32),
}

/// One cycle's worth of work for one worker: base pointers of whole frames.
#[derive(Clone, Copy)]
struct DarkJob {
    raw: RawPtr,
    dark: Option<*const f32>,
    out: *mut f32,
}

// SAFETY: DarkJob is Send because:
// 1. The pointers come from buffers the driver borrows for the whole of
//    `DarkSubtractPool::run`, which does not return before every worker that
//    received a job has reported completion or exited
// 2. Each worker writes only `out[range]` of its own fixed range; ranges are
//    disjoint, so no two threads write the same element
// 3. `raw` and `dark` are only read
unsafe impl Send for DarkJob {}

impl DarkJob {
    /// Run the kernel over `range`.
    ///
    /// # Safety
    /// The frames behind the pointers must be live, hold at least `range.end`
    /// elements, and `out[range]` must not be accessed by anyone else.
    unsafe fn execute(&self, range: Range<usize>) {
        let len = range.len();
        if len == 0 {
            return;
        }
        // SAFETY: guaranteed by the caller contract above.
        let out = std::slice::from_raw_parts_mut(self.out.add(range.start), len);
        let dark = self
            .dark
            .map(|d| std::slice::from_raw_parts(d.add(range.start), len));
        match self.raw {
            RawPtr::U16(p) => subtract_kernel(std::slice::from_raw_parts(p.add(range.start), len), dark, out),
            RawPtr::I16(p) => subtract_kernel(std::slice::from_raw_parts(p.add(range.start), len), dark, out),
            RawPtr::F32(p) => subtract_kernel(std::slice::from_raw_parts(p.add(range.start), len), dark, out),
        }
    }
}

struct Worker {
    range: Range<usize>,
    request_tx: Option<SyncSender<DarkJob>>,
    done_rx: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

/// Persistent dark-subtraction workers with fixed disjoint ranges.
pub struct DarkSubtractPool {
    workers: Vec<Worker>,
    nelem: usize,
}

impl std::fmt::Debug for DarkSubtractPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DarkSubtractPool")
            .field("workers", &self.workers.len())
            .field("nelem", &self.nelem)
            .finish()
    }
}

impl DarkSubtractPool {
    /// Spawn `threads` workers covering a frame of `nelem` samples.
    ///
    /// Threads are named `{name_prefix}-{index}`.
    pub fn spawn(nelem: usize, threads: usize, name_prefix: &str) -> AppResult<Self> {
        let ranges = partition(nelem, threads);
        let mut workers = Vec::with_capacity(ranges.len());

        for (index, range) in ranges.into_iter().enumerate() {
            let (request_tx, request_rx) = mpsc::sync_channel::<DarkJob>(1);
            let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
            let name = format!("{name_prefix}-{index}");
            let worker_range = range.clone();

            let thread = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    debug!(worker = index, start = worker_range.start, end = worker_range.end, "Dark worker started");
                    while let Ok(job) = request_rx.recv() {
                        // SAFETY: the driver keeps the frames alive until it
                        // has received our completion; our range is ours alone.
                        unsafe { job.execute(worker_range.clone()) };
                        if done_tx.send(()).is_err() {
                            break;
                        }
                    }
                    debug!(worker = index, "Dark worker exiting");
                })
                .map_err(|source| CaminError::ThreadSpawn { name, source })?;

            workers.push(Worker {
                range,
                request_tx: Some(request_tx),
                done_rx,
                thread: Some(thread),
            });
        }

        info!(workers = workers.len(), nelem, "Dark-subtract pool started");
        Ok(Self { workers, nelem })
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True if the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Index ranges, in worker order.
    #[must_use]
    pub fn ranges(&self) -> Vec<Range<usize>> {
        self.workers.iter().map(|w| w.range.clone()).collect()
    }

    /// Dark-subtract one frame across all workers and wait for every one of them.
    pub fn run(&self, raw: &PixelBuffer, dark: Option<&[f32]>, out: &mut [f32]) -> AppResult<()> {
        check_lengths(raw, dark, out)?;
        if out.len() != self.nelem {
            return Err(CaminError::Configuration(format!(
                "dark pool sized for {} samples, frame has {}",
                self.nelem,
                out.len()
            )));
        }

        let job = DarkJob {
            raw: match raw {
                PixelBuffer::U16(v) => RawPtr::U16(v.as_ptr()),
                PixelBuffer::I16(v) => RawPtr::I16(v.as_ptr()),
                PixelBuffer::F32(v) => RawPtr::F32(v.as_ptr()),
            },
            dark: dark.map(<[f32]>::as_ptr),
            out: out.as_mut_ptr(),
        };

        let mut failed = None;
        let mut sent = Vec::with_capacity(self.workers.len());
        for (index, worker) in self.workers.iter().enumerate() {
            let delivered = worker
                .request_tx
                .as_ref()
                .is_some_and(|tx| tx.send(job).is_ok());
            if delivered {
                sent.push(index);
            } else {
                failed.get_or_insert(index);
            }
        }

        // Every worker holding a job must finish before `out` is released.
        for index in sent {
            if self.workers[index].done_rx.recv().is_err() {
                failed.get_or_insert(index);
            }
        }

        match failed {
            Some(index) => {
                warn!(worker = index, "Dark worker disconnected");
                Err(CaminError::WorkerDisconnected { index })
            }
            None => Ok(()),
        }
    }
}

impl Drop for DarkSubtractPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.request_tx.take();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!("Dark worker panicked");
                }
            }
        }
        debug!(workers = self.workers.len(), "Dark-subtract pool stopped");
    }
}
