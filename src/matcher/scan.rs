//! Dense ZNCC scan over every valid template placement.

use std::cmp::Ordering;

use crate::image::ImageView;
use crate::template::TemplatePlan;
use crate::util::{CalibError, CalibResult};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Best placement found by a scan (top-left coordinates).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Peak {
    /// X coordinate (column) of the placement.
    pub x: usize,
    /// Y coordinate (row) of the placement.
    pub y: usize,
    /// ZNCC score in approximately `[-1, 1]`.
    pub score: f32,
}

fn peak_cmp_desc(a: &Peak, b: &Peak) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.y.cmp(&b.y))
        .then_with(|| a.x.cmp(&b.x))
}

fn better(a: Option<Peak>, b: Option<Peak>) -> Option<Peak> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if peak_cmp_desc(&a, &b) == Ordering::Greater {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, None) => a,
        (None, b) => b,
    }
}

/// Scores a single placement; `None` when the window is flat.
pub(crate) fn score_at(
    image: ImageView<'_, u8>,
    tpl: &TemplatePlan,
    x: usize,
    y: usize,
    min_var_i: f32,
) -> Option<f32> {
    let tpl_width = tpl.width();
    let tpl_height = tpl.height();
    let count = (tpl_width * tpl_height) as f32;
    let t_prime = tpl.zero_mean();

    let mut dot = 0.0f32;
    let mut sum_i = 0.0f32;
    let mut sum_i2 = 0.0f32;
    for ty in 0..tpl_height {
        let img_row = image.row(y + ty)?;
        let base = ty * tpl_width;
        for tx in 0..tpl_width {
            let value = *img_row.get(x + tx)? as f32;
            dot += t_prime[base + tx] * value;
            sum_i += value;
            sum_i2 += value * value;
        }
    }

    let var_i = sum_i2 - (sum_i * sum_i) / count;
    if var_i <= min_var_i {
        return None;
    }
    let score = dot / (tpl.var_t() * var_i).sqrt();
    score.is_finite().then_some(score)
}

fn best_in_row(
    image: ImageView<'_, u8>,
    tpl: &TemplatePlan,
    y: usize,
    max_x: usize,
    min_var_i: f32,
) -> Option<Peak> {
    let mut best = None;
    for x in 0..=max_x {
        if let Some(score) = score_at(image, tpl, x, y, min_var_i) {
            best = better(best, Some(Peak { x, y, score }));
        }
    }
    best
}

/// Scans the full placement range and returns the highest-scoring peak.
///
/// Returns `Ok(None)` when every window is flat. Ties resolve to the
/// top-most, then left-most placement.
pub fn scan_best(
    image: ImageView<'_, u8>,
    tpl: &TemplatePlan,
    min_var_i: f32,
) -> CalibResult<Option<Peak>> {
    let img_width = image.width();
    let img_height = image.height();
    let tpl_width = tpl.width();
    let tpl_height = tpl.height();
    if img_width < tpl_width || img_height < tpl_height {
        return Err(CalibError::RoiOutOfBounds {
            x: 0,
            y: 0,
            width: tpl_width,
            height: tpl_height,
            img_width,
            img_height,
        });
    }

    let max_x = img_width - tpl_width;
    let max_y = img_height - tpl_height;

    #[cfg(feature = "rayon")]
    let best = (0..=max_y)
        .into_par_iter()
        .map(|y| best_in_row(image, tpl, y, max_x, min_var_i))
        .reduce(|| None, better);

    #[cfg(not(feature = "rayon"))]
    let best = (0..=max_y)
        .map(|y| best_in_row(image, tpl, y, max_x, min_var_i))
        .fold(None, better);

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::{better, Peak};

    #[test]
    fn better_prefers_score_then_top_left() {
        let a = Peak { x: 4, y: 1, score: 0.9 };
        let b = Peak { x: 2, y: 1, score: 0.9 };
        let c = Peak { x: 0, y: 0, score: 0.5 };
        assert_eq!(better(Some(a), Some(b)), Some(b));
        assert_eq!(better(Some(c), Some(a)), Some(a));
        assert_eq!(better(None, Some(c)), Some(c));
    }
}
