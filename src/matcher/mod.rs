//! Locating the tip template in a frame.
//!
//! [`VisionMatcher`] is the seam the calibration engine uses; any external
//! matcher can be plugged in. [`ZnccMatcher`] is the built-in scalar
//! zero-mean normalised cross-correlation implementation.

mod scan;

use nalgebra::Point2;

use crate::image::ImageView;
use crate::template::{Template, TemplatePlan};
use crate::util::CalibResult;

pub use scan::{scan_best, Peak};

/// Outcome of one template match, consumed right after the call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchResult {
    /// Whether the template was considered present.
    pub found: bool,
    /// Similarity in `[0, 1]`.
    pub score: f64,
    /// Tip pixel in the searched view.
    pub location: Point2<f64>,
}

impl MatchResult {
    /// Score with unmatched results counted as zero.
    pub fn effective_score(&self) -> f64 {
        if self.found {
            self.score
        } else {
            0.0
        }
    }
}

/// Matches a template against a frame.
pub trait VisionMatcher {
    fn locate(&mut self, frame: ImageView<'_, u8>, template: &Template) -> CalibResult<MatchResult>;
}

/// Configuration for [`ZnccMatcher`].
#[derive(Clone, Copy, Debug)]
pub struct ZnccConfig {
    /// Minimum variance of an image window for it to be scored.
    pub min_var_i: f32,
    /// Score at or above which the template counts as found.
    pub found_threshold: f64,
}

impl Default for ZnccConfig {
    fn default() -> Self {
        Self {
            min_var_i: 1e-3,
            found_threshold: 0.6,
        }
    }
}

/// Exhaustive ZNCC matcher; negative correlations are clamped to zero.
///
/// Templates are cropped around the tip, so the reported location is the
/// centre of the best placement rather than its top-left corner.
#[derive(Clone, Debug, Default)]
pub struct ZnccMatcher {
    cfg: ZnccConfig,
}

impl ZnccMatcher {
    /// Creates a matcher with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the matcher configuration.
    pub fn with_config(mut self, cfg: ZnccConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Returns the current configuration.
    pub fn config(&self) -> &ZnccConfig {
        &self.cfg
    }
}

impl VisionMatcher for ZnccMatcher {
    fn locate(&mut self, frame: ImageView<'_, u8>, template: &Template) -> CalibResult<MatchResult> {
        let plan = TemplatePlan::from_view(template.view())?;
        let half_w = plan.width() as f64 / 2.0;
        let half_h = plan.height() as f64 / 2.0;
        let result = match scan_best(frame, &plan, self.cfg.min_var_i)? {
            Some(peak) => {
                let score = (peak.score as f64).clamp(0.0, 1.0);
                MatchResult {
                    found: score >= self.cfg.found_threshold,
                    score,
                    location: Point2::new(peak.x as f64 + half_w, peak.y as f64 + half_h),
                }
            }
            None => MatchResult {
                found: false,
                score: 0.0,
                location: Point2::origin(),
            },
        };
        Ok(result)
    }
}
