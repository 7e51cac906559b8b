//! Crop/correct republish loop.
//!
//! Watches a source stream; every time its `cnt0` changes, the configured
//! window is cropped into the output stream, optionally dark-subtracted and
//! multiplied by a mask. The output mirrors the source `cnt0`.
//!
//! With a dark frame the output is float. Without one it keeps the source
//! type, and a mask is applied to `u16` output as an integer factor.

use crate::config::ExtractConfig;
use crate::error::{AppResult, CaminError};
use crate::camin::resolve_slot;
use aol_stream::{DataType, ImageShape, PixelBuffer, StreamImage, StreamRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Crop window geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    size_x: usize,
    size_y: usize,
    xstart: usize,
    ystart: usize,
    input_x: usize,
}

impl Window {
    /// Input index of output element `(x, y)`.
    #[inline]
    fn input_index(&self, x: usize, y: usize) -> usize {
        (self.ystart + y) * self.input_x + self.xstart + x
    }

    fn rows(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.size_y).map(move |y| (y * self.size_x, self.input_index(0, y)))
    }
}

/// Single-threaded crop/dark/mask republisher.
#[derive(Debug)]
pub struct CropExtractLoop {
    input: Arc<StreamImage>,
    dark: Option<Arc<StreamImage>>,
    mask: Option<Arc<StreamImage>>,
    output: Arc<StreamImage>,
    window: Window,
    poll_interval: Duration,
    last_cnt0: Option<u64>,
}

impl CropExtractLoop {
    /// Validate the configuration against the streams and create the output.
    pub fn new(config: &ExtractConfig, registry: &StreamRegistry) -> AppResult<Self> {
        let input = registry.open(&config.input)?;
        let in_shape = input.shape();

        match input.datatype() {
            DataType::U16 | DataType::F32 => {}
            other => {
                return Err(CaminError::UnsupportedDataType {
                    stream: config.input.clone(),
                    datatype: other,
                })
            }
        }

        let fits_x = u64::from(config.xstart) + u64::from(config.size_x) <= u64::from(in_shape.size_x);
        let fits_y = u64::from(config.ystart) + u64::from(config.size_y) <= u64::from(in_shape.size_y);
        if config.size_x == 0 || config.size_y == 0 || !fits_x || !fits_y {
            return Err(CaminError::CropOutOfBounds {
                size_x: config.size_x,
                size_y: config.size_y,
                xstart: config.xstart,
                ystart: config.ystart,
                input_x: in_shape.size_x,
                input_y: in_shape.size_y,
            });
        }

        let mask = registry.get(&config.mask);
        if let Some(mask) = &mask {
            check_frame(mask, config.size_x, config.size_y)?;
        }

        let dark = config.dark.as_deref().and_then(|name| registry.get(name));
        if let Some(dark) = &dark {
            check_frame(dark, in_shape.size_x, in_shape.size_y)?;
        }

        let out_type = if dark.is_some() {
            DataType::F32
        } else {
            input.datatype()
        };
        if registry.remove(&config.output).is_some() {
            debug!(stream = %config.output, "Replacing existing output stream");
        }
        let output = registry.create(
            &config.output,
            out_type,
            ImageShape::new_2d(config.size_x, config.size_y),
        )?;

        info!(
            input = %config.input,
            output = %config.output,
            size_x = config.size_x,
            size_y = config.size_y,
            xstart = config.xstart,
            ystart = config.ystart,
            dark = dark.is_some(),
            mask = mask.is_some(),
            datatype = %out_type,
            "Crop loop configured"
        );

        Ok(Self {
            input,
            dark,
            mask,
            output,
            window: Window {
                size_x: config.size_x as usize,
                size_y: config.size_y as usize,
                xstart: config.xstart as usize,
                ystart: config.ystart as usize,
                input_x: in_shape.size_x as usize,
            },
            poll_interval: Duration::from_micros(config.poll_interval_us),
            last_cnt0: None,
        })
    }

    /// Output stream.
    #[must_use]
    pub fn output(&self) -> &Arc<StreamImage> {
        &self.output
    }

    /// Process the source frame if it is new. Returns whether a frame was published.
    pub fn step(&mut self) -> AppResult<bool> {
        let cnt0 = self.input.cnt0();
        if self.last_cnt0 == Some(cnt0) {
            return Ok(false);
        }
        self.last_cnt0 = Some(cnt0);

        self.output.set_writing(true);
        let result = self.process();
        if let Err(e) = result {
            self.output.set_writing(false);
            return Err(e);
        }
        self.output.set_cnt0(cnt0);
        self.output.set_writing(false);
        self.output.post_all();
        Ok(true)
    }

    /// Poll until `stop` is raised. Returns the number of frames published.
    pub fn run(&mut self, stop: &AtomicBool) -> AppResult<u64> {
        let mut frames = 0u64;
        while !stop.load(Ordering::Acquire) {
            std::thread::sleep(self.poll_interval);
            if self.step()? {
                frames += 1;
            }
        }
        info!(output = self.output.name(), frames, "Crop loop stopped");
        Ok(frames)
    }

    fn process(&self) -> AppResult<()> {
        let slot = resolve_slot(&self.input)? as usize;
        let input = self.input.read();
        let in_offset = slot * self.input.nelem();
        let window = self.window;
        let dark = self.dark.as_ref().map(|d| d.read());
        let mask = self.mask.as_ref().map(|m| m.read());
        let mask = match &mask {
            Some(m) => Some(m.as_f32()?),
            None => None,
        };
        let mut output = self.output.write();

        match (&*input, &mut *output) {
            (PixelBuffer::U16(src), PixelBuffer::U16(out)) => {
                let src = &src[in_offset..];
                for (o, i) in window.rows() {
                    out[o..o + window.size_x].copy_from_slice(&src[i..i + window.size_x]);
                }
                if let Some(mask) = mask {
                    for (v, &m) in out.iter_mut().zip(mask) {
                        *v = (i64::from(*v) * m as i64) as u16;
                    }
                }
            }
            (src, PixelBuffer::F32(out)) => {
                let dark = match &dark {
                    Some(d) => Some(d.as_f32()?),
                    None => None,
                };
                for (o, i) in window.rows() {
                    for x in 0..window.size_x {
                        let raw = match src {
                            PixelBuffer::U16(s) => f32::from(s[in_offset + i + x]),
                            PixelBuffer::F32(s) => s[in_offset + i + x],
                            PixelBuffer::I16(s) => f32::from(s[in_offset + i + x]),
                        };
                        out[o + x] = match dark {
                            Some(dark) => raw - dark[i + x],
                            None => raw,
                        };
                    }
                }
                if let Some(mask) = mask {
                    for (v, &m) in out.iter_mut().zip(mask) {
                        *v *= m;
                    }
                }
            }
            (src, out) => {
                return Err(CaminError::TypeMismatch {
                    stream: self.output.name().to_string(),
                    expected: src.datatype(),
                    actual: out.datatype(),
                })
            }
        }
        Ok(())
    }
}

/// Correction frames (dark, mask) must be float and of the given size.
fn check_frame(image: &StreamImage, size_x: u32, size_y: u32) -> AppResult<()> {
    let shape = image.shape();
    if shape.size_x != size_x || shape.size_y != size_y {
        return Err(CaminError::ShapeMismatch {
            stream: image.name().to_string(),
            expected_x: size_x,
            expected_y: size_y,
            actual_x: shape.size_x,
            actual_y: shape.size_y,
        });
    }
    if image.datatype() != DataType::F32 {
        return Err(CaminError::TypeMismatch {
            stream: image.name().to_string(),
            expected: DataType::F32,
            actual: image.datatype(),
        });
    }
    Ok(())
}
