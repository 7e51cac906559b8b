//! Error types for stream lookup, creation and typed access.

use crate::pixel::DataType;
use thiserror::Error;

/// Convenience alias for results returned by this crate.
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Errors raised by the stream store.
///
/// All variants describe a misconfiguration (a missing stream, a stream with the
/// wrong shape or element type). None of them is transient, so callers on the
/// real-time path treat every `StreamError` as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// No stream is registered under this name.
    #[error("stream '{0}' not found")]
    NotFound(String),

    /// A stream with this name already exists.
    #[error("stream '{0}' already exists")]
    AlreadyExists(String),

    /// A stream or buffer does not have the expected number of elements.
    #[error("stream '{name}' shape mismatch: expected {expected} elements, found {actual}")]
    ShapeMismatch {
        /// Stream name
        name: String,
        /// Expected element count
        expected: usize,
        /// Element count found
        actual: usize,
    },

    /// Typed access with the wrong element type.
    #[error("element type mismatch: expected {expected}, found {actual}")]
    TypeMismatch {
        /// Requested element type
        expected: DataType,
        /// Actual element type
        actual: DataType,
    },

    /// Ring slot index outside `[0, depth)`.
    #[error("stream '{name}' slot {slot} out of range (depth {depth})")]
    SliceOutOfRange {
        /// Stream name
        name: String,
        /// Requested slot
        slot: i64,
        /// Ring depth
        depth: u32,
    },

    /// Zero-sized axis.
    #[error("stream '{0}' has an empty axis")]
    InvalidShape(String),
}
