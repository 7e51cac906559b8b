//! Copy of the current source frame into private scratch memory.

use crate::error::{AppResult, CaminError};
use aol_stream::{DataType, PixelBuffer, StreamError, StreamImage};

/// Private copy of one source frame, typed like the source.
///
/// Allocated once per pipeline instance and overwritten every cycle.
#[derive(Debug, Clone)]
pub struct ScratchFrame {
    buffer: PixelBuffer,
}

impl ScratchFrame {
    /// Zeroed scratch frame of `nelem` samples of `datatype`.
    #[must_use]
    pub fn new(datatype: DataType, nelem: usize) -> Self {
        Self {
            buffer: PixelBuffer::zeroed(datatype, nelem),
        }
    }

    /// Sample type.
    #[must_use]
    pub fn datatype(&self) -> DataType {
        self.buffer.datatype()
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True for a zero-sized frame.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Scratch contents.
    #[must_use]
    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    /// Copy ring slot `slot` of `source` into the scratch frame.
    pub fn fill_from(&mut self, source: &StreamImage, slot: u32) -> AppResult<()> {
        let nelem = self.buffer.len();
        let offset = slot as usize * nelem;
        let data = source.read();
        if offset + nelem > data.len() {
            return Err(StreamError::SliceOutOfRange {
                name: source.name().to_string(),
                slot: i64::from(slot),
                depth: source.shape().depth.unwrap_or(1),
            }
            .into());
        }

        match (&mut self.buffer, &*data) {
            (PixelBuffer::U16(dst), PixelBuffer::U16(src)) => {
                dst.copy_from_slice(&src[offset..offset + nelem]);
            }
            (PixelBuffer::I16(dst), PixelBuffer::I16(src)) => {
                dst.copy_from_slice(&src[offset..offset + nelem]);
            }
            (PixelBuffer::F32(dst), PixelBuffer::F32(src)) => {
                dst.copy_from_slice(&src[offset..offset + nelem]);
            }
            (dst, src) => {
                return Err(CaminError::TypeMismatch {
                    stream: source.name().to_string(),
                    expected: dst.datatype(),
                    actual: src.datatype(),
                })
            }
        }
        Ok(())
    }
}

/// Ring slot holding the newest frame of `source`.
///
/// 2D images have a single slot. Rings publish the slot in `cnt1`; `-1` means
/// the writer has not stamped it yet and the last slot is used.
pub fn resolve_slot(source: &StreamImage) -> AppResult<u32> {
    let Some(depth) = source.shape().depth else {
        return Ok(0);
    };
    let cnt1 = source.cnt1();
    if cnt1 == -1 {
        return Ok(depth.saturating_sub(1));
    }
    u32::try_from(cnt1)
        .ok()
        .filter(|&slot| slot < depth)
        .ok_or_else(|| {
            StreamError::SliceOutOfRange {
                name: source.name().to_string(),
                slot: cnt1,
                depth,
            }
            .into()
        })
}
