//! Custom error types for the camera-input pipeline.
//!
//! This module defines the primary error type, `CaminError`. Using the `thiserror`
//! crate, it provides a single place where every failure of the pipeline and of
//! the crop loop is described.
//!
//! ## Error Hierarchy
//!
//! - **Fatal configuration errors**: a required stream is missing, a stream has an
//!   unsupported element type, a dark frame or mask does not match the frame it
//!   corrects, a crop window leaves the input. Continuing would silently corrupt
//!   wavefront data, so [`CaminError::is_fatal`] returns `true` and the binary
//!   terminates the process after logging.
//! - **Runtime failures**: a worker thread could not be spawned or went away.
//!   Also fatal for the pipeline instance; no degraded mode exists.
//!
//! Soft timing misses (late frames, saturated semaphores) are *not* errors. They are
//! logged with `tracing::warn!` and reported in the cycle outcome instead.

use aol_stream::{DataType, StreamError};
use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type AppResult<T> = std::result::Result<T, CaminError>;

/// Primary error type for the camera-input pipeline.
#[derive(Error, Debug)]
pub enum CaminError {
    /// Stream lookup or typed access failed.
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values parse but are logically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The element type of a stream is outside what this stage supports.
    #[error("Stream '{stream}' has unsupported element type {datatype}")]
    UnsupportedDataType {
        /// Stream name
        stream: String,
        /// Offending element type
        datatype: DataType,
    },

    /// A correction frame does not have the size of the frame it corrects.
    #[error("Stream '{stream}' has wrong size: expected {expected_x}x{expected_y}, found {actual_x}x{actual_y}")]
    ShapeMismatch {
        /// Stream name
        stream: String,
        /// Expected width
        expected_x: u32,
        /// Expected height
        expected_y: u32,
        /// Actual width
        actual_x: u32,
        /// Actual height
        actual_y: u32,
    },

    /// A correction frame does not have the required element type.
    #[error("Stream '{stream}' has wrong type: expected {expected}, found {actual}")]
    TypeMismatch {
        /// Stream name
        stream: String,
        /// Required element type
        expected: DataType,
        /// Element type found
        actual: DataType,
    },

    /// A crop window extends past the input frame.
    #[error("Crop window {size_x}x{size_y}+{xstart}+{ystart} exceeds input {input_x}x{input_y}")]
    CropOutOfBounds {
        /// Window width
        size_x: u32,
        /// Window height
        size_y: u32,
        /// Window x offset
        xstart: u32,
        /// Window y offset
        ystart: u32,
        /// Input width
        input_x: u32,
        /// Input height
        input_y: u32,
    },

    /// No reader semaphore left on the source stream.
    #[error("No free semaphore on stream '{0}'")]
    NoFreeSemaphore(String),

    /// OS refused to create a worker thread.
    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        /// Thread name
        name: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A dark-subtraction worker stopped answering.
    #[error("Dark-subtraction worker {index} disconnected")]
    WorkerDisconnected {
        /// Worker index
        index: usize,
    },

    /// Effective configuration could not be rendered as TOML.
    #[error("Configuration serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for CaminError {
    fn from(err: figment::Error) -> Self {
        CaminError::Config(Box::new(err))
    }
}

impl CaminError {
    /// True for misconfigurations that make continuing unsafe.
    ///
    /// Everything this pipeline reports as an error is fatal except plain I/O
    /// failures (which only occur outside the real-time path, e.g. while reading a
    /// configuration file that the caller may retry with another path).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CaminError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_converts() {
        let err: CaminError = StreamError::NotFound("aol0_wfsim".into()).into();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "Stream error: stream 'aol0_wfsim' not found");
    }

    #[test]
    fn test_io_error_is_not_fatal() {
        let err: CaminError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_shape_mismatch_message() {
        let err = CaminError::ShapeMismatch {
            stream: "csmask".into(),
            expected_x: 4,
            expected_y: 4,
            actual_x: 2,
            actual_y: 4,
        };
        assert_eq!(
            err.to_string(),
            "Stream 'csmask' has wrong size: expected 4x4, found 2x4"
        );
    }
}
