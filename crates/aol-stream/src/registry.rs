//! Name → stream directory.
//!
//! The registry is cheap to clone (it is an `Arc` around the map); every clone
//! sees the same set of streams, the way every process sees the same shared
//! memory directory.

use crate::error::{StreamError, StreamResult};
use crate::image::{ImageShape, StreamImage};
use crate::pixel::{DataType, PixelBuffer};
use crate::DEFAULT_SEMAPHORE_COUNT;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Directory of named streams.
#[derive(Clone, Debug)]
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<String, Arc<StreamImage>>>>,
    semaphore_count: usize,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    /// Empty registry; new streams get [`DEFAULT_SEMAPHORE_COUNT`] semaphores.
    #[must_use]
    pub fn new() -> Self {
        Self::with_semaphore_count(DEFAULT_SEMAPHORE_COUNT)
    }

    /// Empty registry with a custom per-stream semaphore count.
    ///
    /// A count of zero creates streams that readers have to poll.
    #[must_use]
    pub fn with_semaphore_count(semaphore_count: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            semaphore_count,
        }
    }

    /// Semaphores allocated for each new stream.
    #[must_use]
    pub fn semaphore_count(&self) -> usize {
        self.semaphore_count
    }

    /// Create a zero-filled stream. Fails if the name is taken.
    pub fn create(
        &self,
        name: &str,
        datatype: DataType,
        shape: ImageShape,
    ) -> StreamResult<Arc<StreamImage>> {
        let image = StreamImage::new(name, datatype, shape, self.semaphore_count)?;
        self.insert_new(image)
    }

    /// Create a stream from existing pixel data. Fails if the name is taken.
    pub fn create_with_data(
        &self,
        name: &str,
        shape: ImageShape,
        data: PixelBuffer,
    ) -> StreamResult<Arc<StreamImage>> {
        let image = StreamImage::with_data(name, shape, data, self.semaphore_count)?;
        self.insert_new(image)
    }

    fn insert_new(&self, image: StreamImage) -> StreamResult<Arc<StreamImage>> {
        let mut streams = self.streams.write();
        if streams.contains_key(image.name()) {
            return Err(StreamError::AlreadyExists(image.name().to_string()));
        }
        info!(
            stream = image.name(),
            datatype = %image.datatype(),
            size_x = image.shape().size_x,
            size_y = image.shape().size_y,
            depth = ?image.shape().depth,
            "Stream created"
        );
        let image = Arc::new(image);
        streams.insert(image.name().to_string(), Arc::clone(&image));
        Ok(image)
    }

    /// Resolve a stream that must exist.
    pub fn open(&self, name: &str) -> StreamResult<Arc<StreamImage>> {
        self.get(name)
            .ok_or_else(|| StreamError::NotFound(name.to_string()))
    }

    /// Resolve a stream that may be absent.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<StreamImage>> {
        self.streams.read().get(name).cloned()
    }

    /// Reuse a float 2D stream of the requested size, or (re)create it filled with `fill`.
    ///
    /// An existing stream with another shape or element type is replaced; holders
    /// of the old handle keep the old stream alive but no longer see updates.
    pub fn load_or_create_2d(
        &self,
        name: &str,
        size_x: u32,
        size_y: u32,
        fill: f32,
    ) -> StreamResult<Arc<StreamImage>> {
        let shape = ImageShape::new_2d(size_x, size_y);
        let mut streams = self.streams.write();

        if let Some(existing) = streams.get(name) {
            if existing.shape() == shape && existing.datatype() == DataType::F32 {
                debug!(stream = name, "Reusing existing stream");
                return Ok(Arc::clone(existing));
            }
            info!(
                stream = name,
                old_shape = ?existing.shape(),
                new_shape = ?shape,
                "Replacing stream with mismatched shape or type"
            );
        }

        let data = PixelBuffer::F32(vec![fill; shape.total_elements()]);
        let image = Arc::new(StreamImage::with_data(
            name,
            shape,
            data,
            self.semaphore_count,
        )?);
        streams.insert(name.to_string(), Arc::clone(&image));
        Ok(image)
    }

    /// Remove a stream from the directory.
    pub fn remove(&self, name: &str) -> Option<Arc<StreamImage>> {
        self.streams.write().remove(name)
    }

    /// Sorted list of stream names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }
}
