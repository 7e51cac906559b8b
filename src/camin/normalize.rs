//! Flux normalization of the dark-subtracted frame.

use crate::error::AppResult;
use aol_stream::StreamImage;

/// Scale factors derived from the total flux.
///
/// `alpha` and `beta` are what an external accelerator needs to reproduce the
/// normalization (`alpha = factor`, `beta = -floor_coefficient`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationCoefficients {
    /// Multiplier applied to the frame
    pub factor: f32,
    /// `total / (total + floor * nelem)`
    pub floor_coefficient: f32,
}

impl Default for NormalizationCoefficients {
    fn default() -> Self {
        Self::identity()
    }
}

impl NormalizationCoefficients {
    /// No normalization.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            factor: 1.0,
            floor_coefficient: 1.0,
        }
    }

    /// Coefficients for a frame of `nelem` samples with flux `total`.
    #[must_use]
    pub fn from_total(total: f32, floor: f32, nelem: usize) -> Self {
        let denominator = total + floor * nelem as f32;
        Self {
            factor: 1.0 / denominator,
            floor_coefficient: total / denominator,
        }
    }

    /// Accelerator gain.
    #[must_use]
    pub fn alpha(&self) -> f32 {
        self.factor
    }

    /// Accelerator offset coefficient.
    #[must_use]
    pub fn beta(&self) -> f32 {
        -self.floor_coefficient
    }
}

/// `out[i] = input[i] * factor`.
pub fn scale_into(input: &[f32], factor: f32, out: &mut [f32]) {
    for (o, &v) in out.iter_mut().zip(input) {
        *o = v * factor;
    }
}

/// Write `imwfs1 = imwfs0 * factor` under the writer protocol.
pub fn publish_normalized(imwfs0: &StreamImage, imwfs1: &StreamImage, factor: f32) -> AppResult<u64> {
    imwfs1.set_writing(true);
    let scaled = {
        let input = imwfs0.read();
        let mut output = imwfs1.write();
        input
            .as_f32()
            .and_then(|input| output.as_f32_mut().map(|out| scale_into(input, factor, out)))
    };
    if let Err(e) = scaled {
        imwfs1.set_writing(false);
        return Err(e.into());
    }
    imwfs1.post_all();
    let cnt0 = imwfs1.increment_cnt0();
    imwfs1.set_writing(false);
    Ok(cnt0)
}
