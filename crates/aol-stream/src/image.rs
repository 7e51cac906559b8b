//! Shared image stream: pixel data plus the counter/semaphore protocol.
//!
//! # Protocol
//! ```text
//! writer:  set_writing(true) -> mutate data -> set_cnt1 / increment_cnt0
//!          -> set_writing(false) -> post_all()
//! reader:  wait on claimed semaphore (or poll cnt0) -> read data
//! ```
//!
//! Counters, flags and timestamps are atomics so readers can poll them without
//! touching the data lock. Pixel data sits behind a `parking_lot::RwLock`; a
//! writer holds the write guard only for the duration of one frame update.
//!
//! Only one writer per stream is expected. This is a convention of the loop
//! configuration, not something the type enforces.

use crate::error::{StreamError, StreamResult};
use crate::pixel::{DataType, PixelBuffer};
use crate::semaphore::StreamSemaphore;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Image dimensions. A `depth` turns the image into a ring of `depth` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    /// Frame width
    pub size_x: u32,
    /// Frame height
    pub size_y: u32,
    /// Ring depth (third axis), if any
    pub depth: Option<u32>,
}

impl ImageShape {
    /// Plain 2D image.
    #[must_use]
    pub fn new_2d(size_x: u32, size_y: u32) -> Self {
        Self {
            size_x,
            size_y,
            depth: None,
        }
    }

    /// Ring of `depth` frames of `size_x * size_y`.
    #[must_use]
    pub fn new_ring(size_x: u32, size_y: u32, depth: u32) -> Self {
        Self {
            size_x,
            size_y,
            depth: Some(depth),
        }
    }

    /// Number of axes (2 or 3).
    #[must_use]
    pub fn naxis(&self) -> u8 {
        if self.depth.is_some() {
            3
        } else {
            2
        }
    }

    /// Elements in one frame.
    #[must_use]
    pub fn frame_elements(&self) -> usize {
        self.size_x as usize * self.size_y as usize
    }

    /// Elements in the whole image (all ring slots).
    #[must_use]
    pub fn total_elements(&self) -> usize {
        self.frame_elements() * self.depth.unwrap_or(1) as usize
    }

    fn is_empty(&self) -> bool {
        self.size_x == 0 || self.size_y == 0 || self.depth == Some(0)
    }
}

/// A named stream with its data and synchronization metadata.
#[derive(Debug)]
pub struct StreamImage {
    name: String,
    shape: ImageShape,
    datatype: DataType,
    data: RwLock<PixelBuffer>,
    cnt0: AtomicU64,
    cnt1: AtomicI64,
    writing: AtomicBool,
    atime_ns: AtomicU64,
    semaphores: Vec<StreamSemaphore>,
    claimed: Vec<AtomicBool>,
}

impl StreamImage {
    /// Create a zero-filled stream with `semaphore_count` reader semaphores.
    pub fn new(
        name: impl Into<String>,
        datatype: DataType,
        shape: ImageShape,
        semaphore_count: usize,
    ) -> StreamResult<Self> {
        let data = PixelBuffer::zeroed(datatype, shape.total_elements());
        Self::with_data(name, shape, data, semaphore_count)
    }

    /// Create a stream around existing pixel data.
    ///
    /// The buffer length must equal `shape.total_elements()`.
    pub fn with_data(
        name: impl Into<String>,
        shape: ImageShape,
        data: PixelBuffer,
        semaphore_count: usize,
    ) -> StreamResult<Self> {
        let name = name.into();
        if shape.is_empty() {
            return Err(StreamError::InvalidShape(name));
        }
        if data.len() != shape.total_elements() {
            return Err(StreamError::ShapeMismatch {
                name,
                expected: shape.total_elements(),
                actual: data.len(),
            });
        }

        Ok(Self {
            name,
            shape,
            datatype: data.datatype(),
            data: RwLock::new(data),
            cnt0: AtomicU64::new(0),
            cnt1: AtomicI64::new(-1),
            writing: AtomicBool::new(false),
            atime_ns: AtomicU64::new(now_ns()),
            semaphores: (0..semaphore_count).map(|_| StreamSemaphore::new()).collect(),
            claimed: (0..semaphore_count).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    /// Stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element type (fixed for the stream's lifetime).
    #[must_use]
    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    /// Dimensions (fixed for the stream's lifetime).
    #[must_use]
    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    /// Elements per frame.
    #[must_use]
    pub fn nelem(&self) -> usize {
        self.shape.frame_elements()
    }

    // =========================================================================
    // Counters and flags
    // =========================================================================

    /// Arrival counter.
    #[must_use]
    pub fn cnt0(&self) -> u64 {
        self.cnt0.load(Ordering::Acquire)
    }

    /// Overwrite the arrival counter.
    pub fn set_cnt0(&self, value: u64) {
        self.cnt0.store(value, Ordering::Release);
    }

    /// Advance the arrival counter, returning the new value.
    pub fn increment_cnt0(&self) -> u64 {
        self.cnt0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Secondary counter (`-1` when unset).
    #[must_use]
    pub fn cnt1(&self) -> i64 {
        self.cnt1.load(Ordering::Acquire)
    }

    /// Overwrite the secondary counter.
    pub fn set_cnt1(&self, value: i64) {
        self.cnt1.store(value, Ordering::Release);
    }

    /// True while the writer is mutating the data.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    /// Set or clear the write-in-progress flag.
    pub fn set_writing(&self, writing: bool) {
        self.writing.store(writing, Ordering::Release);
    }

    /// Time of the last update.
    #[must_use]
    pub fn atime(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.atime_ns.load(Ordering::Acquire))
    }

    /// Set the update timestamp.
    pub fn set_atime(&self, time: SystemTime) {
        let ns = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.atime_ns.store(ns, Ordering::Release);
    }

    /// Seconds elapsed between the update timestamp and `now` (0 if `now` is earlier).
    #[must_use]
    pub fn seconds_since_atime(&self, now: SystemTime) -> f64 {
        now.duration_since(self.atime())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Shared access to the pixel data.
    pub fn read(&self) -> RwLockReadGuard<'_, PixelBuffer> {
        self.data.read()
    }

    /// Exclusive access to the pixel data.
    pub fn write(&self) -> RwLockWriteGuard<'_, PixelBuffer> {
        self.data.write()
    }

    /// Publish one frame into ring slot `slot` (or the whole image for 2D streams).
    ///
    /// Runs the full writer protocol: write flag, copy, `cnt1 = slot`,
    /// `cnt0 += 1`, timestamp, post all semaphores. Returns the new `cnt0`.
    pub fn publish_frame(&self, slot: u32, frame: &PixelBuffer) -> StreamResult<u64> {
        if frame.len() != self.nelem() {
            return Err(StreamError::ShapeMismatch {
                name: self.name.clone(),
                expected: self.nelem(),
                actual: frame.len(),
            });
        }
        let depth = self.shape.depth.unwrap_or(1);
        if slot >= depth {
            return Err(StreamError::SliceOutOfRange {
                name: self.name.clone(),
                slot: i64::from(slot),
                depth,
            });
        }

        self.set_writing(true);
        {
            let mut data = self.data.write();
            let copied = data.copy_range_from(slot as usize * self.nelem(), frame);
            if let Err(e) = copied {
                self.set_writing(false);
                return Err(e);
            }
        }
        self.set_cnt1(i64::from(slot));
        let cnt0 = self.increment_cnt0();
        self.set_atime(SystemTime::now());
        self.set_writing(false);
        self.post_all();
        Ok(cnt0)
    }

    // =========================================================================
    // Semaphores
    // =========================================================================

    /// Number of reader semaphores. Zero means readers must poll `cnt0`.
    #[must_use]
    pub fn semaphore_count(&self) -> usize {
        self.semaphores.len()
    }

    /// Semaphore `index`, if it exists.
    #[must_use]
    pub fn semaphore(&self, index: usize) -> Option<&StreamSemaphore> {
        self.semaphores.get(index)
    }

    /// Reserve a semaphore for one reader.
    ///
    /// Returns `preferred` if it exists and is unclaimed, otherwise the lowest
    /// unclaimed index, or `None` when every semaphore is taken.
    pub fn claim_semaphore(&self, preferred: usize) -> Option<usize> {
        let try_claim = |i: usize| {
            self.claimed[i]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        };

        if preferred < self.claimed.len() && try_claim(preferred) {
            return Some(preferred);
        }
        (0..self.claimed.len()).find(|&i| try_claim(i))
    }

    /// Give back a semaphore reserved with [`claim_semaphore`](Self::claim_semaphore).
    pub fn release_semaphore(&self, index: usize) {
        if let Some(flag) = self.claimed.get(index) {
            flag.store(false, Ordering::Release);
        }
    }

    /// Post every reader semaphore (saturating). Returns how many posts landed.
    pub fn post_all(&self) -> usize {
        self.semaphores.iter().filter(|s| s.post()).count()
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
