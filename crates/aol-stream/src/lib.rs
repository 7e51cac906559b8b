//! `aol-stream`
//!
//! In-process shared image streams for the adaptive-optics loop.
//!
//! A stream is a named image (optionally a ring of frames along a third axis)
//! carrying the metadata every real-time consumer relies on:
//!
//! - `cnt0`: arrival counter, advanced once per published frame
//! - `cnt1`: secondary counter (last written ring slot, or a loop iteration id)
//! - `write`: write-in-progress flag set by the single writer around mutation
//! - `atime`: timestamp of the last update
//! - a set of counting semaphores, one per potential reader, all posted on publish
//!
//! Streams live in a [`StreamRegistry`], the in-process stand-in for the shared
//! memory directory. Readers resolve streams by name and then work with an
//! `Arc<StreamImage>` handle.
//!
//! # Example
//!
//! ```
//! use aol_stream::{DataType, ImageShape, StreamRegistry};
//!
//! let registry = StreamRegistry::new();
//! let image = registry
//!     .create("aol0_wfsim", DataType::U16, ImageShape::new_2d(4, 4))
//!     .unwrap();
//!
//! let sem = image.claim_semaphore(1).unwrap();
//! image.post_all();
//! assert!(image.semaphore(sem).unwrap().try_wait());
//! ```

pub mod error;
pub mod image;
pub mod pixel;
pub mod registry;
pub mod semaphore;

pub use error::{StreamError, StreamResult};
pub use image::{ImageShape, StreamImage};
pub use pixel::{DataType, PixelBuffer};
pub use registry::StreamRegistry;
pub use semaphore::{StreamSemaphore, SEMAPHORE_MAXVAL};

/// Number of semaphores allocated per stream unless the registry says otherwise.
pub const DEFAULT_SEMAPHORE_COUNT: usize = 10;
