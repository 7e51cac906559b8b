//! Typed pixel storage for stream images.
//!
//! Wavefront sensor cameras deliver 16-bit samples (unsigned or signed depending
//! on the readout electronics); everything downstream of dark subtraction works
//! in single-precision float. [`PixelBuffer`] is a closed sum type over exactly
//! these kinds, so every consumer handles each of them explicitly.

use crate::error::{StreamError, StreamResult};
use std::fmt;

/// Element type of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 16-bit unsigned integer samples (most scientific cameras)
    U16,
    /// 16-bit signed integer samples
    I16,
    /// 32-bit floating point samples (processed data)
    F32,
}

impl DataType {
    /// Size of one sample in bytes.
    #[must_use]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            DataType::U16 | DataType::I16 => 2,
            DataType::F32 => 4,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DataType::U16 => "u16",
            DataType::I16 => "i16",
            DataType::F32 => "f32",
        };
        write!(f, "{}", label)
    }
}

/// Pixel storage for one stream (all frames of a ring, contiguous).
#[derive(Clone, Debug, PartialEq)]
pub enum PixelBuffer {
    /// 16-bit unsigned integer pixels
    U16(Vec<u16>),
    /// 16-bit signed integer pixels
    I16(Vec<i16>),
    /// 32-bit floating point pixels
    F32(Vec<f32>),
}

impl PixelBuffer {
    /// Allocate a zero-filled buffer of `len` elements.
    #[must_use]
    pub fn zeroed(datatype: DataType, len: usize) -> Self {
        match datatype {
            DataType::U16 => PixelBuffer::U16(vec![0; len]),
            DataType::I16 => PixelBuffer::I16(vec![0; len]),
            DataType::F32 => PixelBuffer::F32(vec![0.0; len]),
        }
    }

    /// Element type of this buffer.
    #[must_use]
    pub fn datatype(&self) -> DataType {
        match self {
            PixelBuffer::U16(_) => DataType::U16,
            PixelBuffer::I16(_) => DataType::I16,
            PixelBuffer::F32(_) => DataType::F32,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U16(v) => v.len(),
            PixelBuffer::I16(v) => v.len(),
            PixelBuffer::F32(v) => v.len(),
        }
    }

    /// True if the buffer holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` widened to `f64`, or `None` if out of range.
    #[must_use]
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        match self {
            PixelBuffer::U16(v) => v.get(i).map(|&x| f64::from(x)),
            PixelBuffer::I16(v) => v.get(i).map(|&x| f64::from(x)),
            PixelBuffer::F32(v) => v.get(i).map(|&x| f64::from(x)),
        }
    }

    fn mismatch(&self, expected: DataType) -> StreamError {
        StreamError::TypeMismatch {
            expected,
            actual: self.datatype(),
        }
    }

    /// Borrow as `u16` samples.
    pub fn as_u16(&self) -> StreamResult<&[u16]> {
        match self {
            PixelBuffer::U16(v) => Ok(v),
            _ => Err(self.mismatch(DataType::U16)),
        }
    }

    /// Borrow mutably as `u16` samples.
    pub fn as_u16_mut(&mut self) -> StreamResult<&mut [u16]> {
        match self {
            PixelBuffer::U16(v) => Ok(v),
            _ => Err(self.mismatch(DataType::U16)),
        }
    }

    /// Borrow as `i16` samples.
    pub fn as_i16(&self) -> StreamResult<&[i16]> {
        match self {
            PixelBuffer::I16(v) => Ok(v),
            _ => Err(self.mismatch(DataType::I16)),
        }
    }

    /// Borrow mutably as `i16` samples.
    pub fn as_i16_mut(&mut self) -> StreamResult<&mut [i16]> {
        match self {
            PixelBuffer::I16(v) => Ok(v),
            _ => Err(self.mismatch(DataType::I16)),
        }
    }

    /// Borrow as `f32` samples.
    pub fn as_f32(&self) -> StreamResult<&[f32]> {
        match self {
            PixelBuffer::F32(v) => Ok(v),
            _ => Err(self.mismatch(DataType::F32)),
        }
    }

    /// Borrow mutably as `f32` samples.
    pub fn as_f32_mut(&mut self) -> StreamResult<&mut [f32]> {
        match self {
            PixelBuffer::F32(v) => Ok(v),
            _ => Err(self.mismatch(DataType::F32)),
        }
    }

    /// Copy `src` into `[offset, offset + src.len())`.
    ///
    /// Both buffers must have the same element type.
    pub fn copy_range_from(&mut self, offset: usize, src: &PixelBuffer) -> StreamResult<()> {
        let end = offset + src.len();
        if end > self.len() {
            return Err(StreamError::ShapeMismatch {
                name: String::from("<buffer>"),
                expected: self.len(),
                actual: end,
            });
        }
        match (self, src) {
            (PixelBuffer::U16(dst), PixelBuffer::U16(s)) => dst[offset..end].copy_from_slice(s),
            (PixelBuffer::I16(dst), PixelBuffer::I16(s)) => dst[offset..end].copy_from_slice(s),
            (PixelBuffer::F32(dst), PixelBuffer::F32(s)) => dst[offset..end].copy_from_slice(s),
            (dst, s) => return Err(dst.mismatch(s.datatype())),
        }
        Ok(())
    }
}
