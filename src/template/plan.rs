//! Template plan precomputation for ZNCC scoring.

use crate::image::ImageView;
use crate::util::{CalibError, CalibResult};

/// Precomputed statistics and zero-mean buffer for template matching.
pub struct TemplatePlan {
    width: usize,
    height: usize,
    mean: f32,
    inv_std: f32,
    zero_mean: Vec<f32>,
    var_t: f32,
}

impl TemplatePlan {
    /// Builds a plan from a template view.
    pub fn from_view(tpl: ImageView<'_, u8>) -> CalibResult<Self> {
        let width = tpl.width();
        let height = tpl.height();
        let count = width
            .checked_mul(height)
            .ok_or(CalibError::InvalidDimensions { width, height })?;

        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for y in 0..height {
            let row = template_row(tpl, y)?;
            for &value in row {
                let v = value as f64;
                sum += v;
                sum_sq += v * v;
            }
        }

        let count_f = count as f64;
        let mean_f64 = sum / count_f;
        let variance = sum_sq / count_f - mean_f64 * mean_f64;
        if variance <= 1e-8 {
            return Err(CalibError::DegenerateTemplate {
                reason: "zero variance",
            });
        }

        let mean = mean_f64 as f32;
        let inv_std = (1.0 / variance.sqrt()) as f32;
        let mut zero_mean = Vec::with_capacity(count);
        let mut var_t = 0.0f32;
        for y in 0..height {
            for &value in template_row(tpl, y)? {
                let centred = value as f32 - mean;
                var_t += centred * centred;
                zero_mean.push(centred);
            }
        }

        Ok(Self {
            width,
            height,
            mean,
            inv_std,
            zero_mean,
            var_t,
        })
    }

    /// Template width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Template height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Mean intensity.
    pub fn mean(&self) -> f32 {
        self.mean
    }

    /// Reciprocal of the intensity standard deviation.
    pub fn inv_std(&self) -> f32 {
        self.inv_std
    }

    /// Row-major zero-mean intensities.
    pub fn zero_mean(&self) -> &[f32] {
        &self.zero_mean
    }

    /// Sum of squared zero-mean intensities.
    pub fn var_t(&self) -> f32 {
        self.var_t
    }
}

fn template_row<'a>(tpl: ImageView<'a, u8>, y: usize) -> CalibResult<&'a [u8]> {
    tpl.row(y).ok_or_else(|| {
        let needed = (y + 1)
            .checked_mul(tpl.stride())
            .and_then(|v| v.checked_add(tpl.width()))
            .unwrap_or(usize::MAX);
        CalibError::BufferTooSmall {
            needed,
            got: tpl.as_slice().len(),
        }
    })
}
