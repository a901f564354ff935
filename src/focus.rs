//! Template-driven focus search along the stage height axis.
//!
//! The searcher samples a fixed window of heights around the current stage
//! height and keeps the one whose frame best matches the template. A sample
//! scoring above the early-exit threshold ends the sweep immediately, which
//! keeps tracking cheap while the tip is already sharp.

use nalgebra::Point2;

use crate::device::{Rig, Z_AXIS};
use crate::image::OwnedImage;
use crate::template::Template;
use crate::trace::{trace_event, trace_span, trace_warn};
use crate::util::{CalibError, CalibResult};

/// Order in which the height window is visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepDirection {
    /// Lowest height first; used while tracking a positive arm step.
    Forward,
    /// Highest height first; used while tracking a negative arm step.
    Backward,
}

impl SweepDirection {
    /// Direction matching the sign of an arm step.
    pub fn for_step(step: f64) -> Self {
        if step > 0.0 {
            Self::Forward
        } else {
            Self::Backward
        }
    }
}

/// Focus search parameters.
#[derive(Clone, Copy, Debug)]
pub struct FocusConfig {
    /// Number of heights sampled in a full sweep (odd, centred on the start).
    pub samples: usize,
    /// Height spacing between samples.
    pub step: f64,
    /// A sample scoring strictly above this ends the sweep.
    pub early_exit_score: f64,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            samples: 9,
            step: 1.0,
            early_exit_score: 0.95,
        }
    }
}

/// Best focus found by a search. The stage is left at the matching height.
#[derive(Clone, Debug)]
pub struct FocusOutcome {
    /// Best match score.
    pub score: f64,
    /// Height of the best sample relative to the height the search started at.
    pub height_offset: f64,
    /// Tip pixel location in the best frame.
    pub location: Point2<f64>,
    /// Frame in which the best match occurred.
    pub frame: OwnedImage,
    /// Number of heights actually sampled.
    pub samples: usize,
}

/// Finds the stage height that best matches a template near the current one.
#[derive(Clone, Copy, Debug, Default)]
pub struct FocusSearcher {
    cfg: FocusConfig,
}

impl FocusSearcher {
    pub fn new(cfg: FocusConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &FocusConfig {
        &self.cfg
    }

    fn offset_at(&self, index: usize, direction: SweepDirection) -> f64 {
        let half = (self.cfg.samples.saturating_sub(1) / 2) as f64;
        let k = index as f64 - half;
        match direction {
            SweepDirection::Forward => k * self.cfg.step,
            SweepDirection::Backward => -k * self.cfg.step,
        }
    }

    /// Sweeps the height window and leaves the stage at the best match.
    ///
    /// Fails with [`CalibError::TrackingLost`] when no sample matched at all.
    pub fn search(
        &self,
        rig: &mut Rig<'_>,
        template: &Template,
        direction: SweepDirection,
    ) -> CalibResult<FocusOutcome> {
        if self.cfg.samples == 0 {
            return Err(CalibError::InvalidInput("focus search needs at least one sample"));
        }
        let _span = trace_span!("focus_search", samples = self.cfg.samples).entered();
        let z0 = rig.stage.position(Z_AXIS)?;

        let mut best: Option<FocusOutcome> = None;
        for index in 0..self.cfg.samples {
            let offset = self.offset_at(index, direction);
            rig.stage.absolute_move(z0 + offset, Z_AXIS)?;
            let frame = rig.camera.frame()?;
            let found = rig.matcher.locate(frame.view(), template)?;
            let score = found.effective_score();

            if score > self.cfg.early_exit_score {
                trace_event!("focus_early_exit", sample = index, score = score, offset = offset);
                return Ok(FocusOutcome {
                    score,
                    height_offset: offset,
                    location: found.location,
                    frame,
                    samples: index + 1,
                });
            }

            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(FocusOutcome {
                    score,
                    height_offset: offset,
                    location: found.location,
                    frame,
                    samples: self.cfg.samples,
                });
            }
        }

        let best = match best {
            Some(best) if best.score > 0.0 => best,
            _ => {
                trace_warn!("focus_tracking_lost", samples = self.cfg.samples);
                return Err(CalibError::TrackingLost);
            }
        };
        rig.stage.absolute_move(z0 + best.height_offset, Z_AXIS)?;
        trace_event!("focus_best", score = best.score, offset = best.height_offset);
        Ok(best)
    }
}
