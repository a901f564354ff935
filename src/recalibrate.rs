//! Re-anchoring after a pipette swap.
//!
//! The transform matrix is assumed to survive the swap; only the anchor moves.
//! Triggering retracts arm axis 0 far enough for the operator to change the
//! pipette and hands back the frame taken there. Nothing moves until the
//! operator confirms the swap with [`Recalibration::resume`], which brings the
//! arm part of the way back. Each following tick advances the arm by a small
//! step until the new tip shows up in the centre of the frame, refocuses until
//! the match is trustworthy, recentres the stage and snapshots the new anchor.

use nalgebra::Vector2;

use crate::device::Rig;
use crate::image::OwnedImage;
use crate::focus::{FocusOutcome, SweepDirection};
use crate::trace::{trace_event, trace_span, trace_warn};
use crate::tracking::TrackingContext;
use crate::transform::Anchor;
use crate::util::math::stage_compensation;
use crate::util::{CalibError, CalibResult};

/// Arm axis retracted and advanced during a pipette swap.
const SWAP_AXIS: usize = 0;

/// Recalibration parameters.
#[derive(Clone, Copy, Debug)]
pub struct RecalConfig {
    /// Distance the arm backs out for the swap.
    pub retract: f64,
    /// Distance the arm comes back right after the swap.
    pub advance: f64,
    /// Arm step per tick while looking for the new tip.
    pub approach_step: f64,
    /// Score a refocus must reach before the correction is trusted.
    pub accept_score: f64,
    /// Ticks without a match before giving up.
    pub max_approach_steps: usize,
    /// Refocus searches below `accept_score` before giving up.
    pub max_refocus_attempts: usize,
    /// Pixels added on each side of the template to form the window searched
    /// while approaching.
    pub zone_margin: usize,
}

impl Default for RecalConfig {
    fn default() -> Self {
        Self {
            retract: 5000.0,
            advance: 3000.0,
            approach_step: 100.0,
            accept_score: 0.98,
            max_approach_steps: 50,
            max_refocus_attempts: 20,
            zone_margin: 16,
        }
    }
}

/// Result of one recalibration tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RecalProgress {
    /// Retracted; waiting for the operator to confirm the swap.
    AwaitingSwap,
    /// The new tip has not been found yet.
    Approaching { steps: usize },
    /// The stage was corrected and a new anchor recorded.
    Done {
        correction: Vector2<f64>,
        anchor: Anchor,
    },
}

/// A pipette swap in progress.
#[derive(Clone, Debug)]
pub struct Recalibration {
    cfg: RecalConfig,
    swapped: bool,
    approach_steps: usize,
}

impl Recalibration {
    /// Retracts the arm for the swap and returns the frame taken there for
    /// the operator to inspect.
    pub fn trigger(
        rig: &mut Rig<'_>,
        cfg: RecalConfig,
        ctx: &TrackingContext<'_>,
    ) -> CalibResult<(Self, OwnedImage)> {
        let _span = trace_span!("recalibration_trigger", retract = cfg.retract).entered();
        rig.arm.relative_move(-cfg.retract, SWAP_AXIS)?;
        rig.settle.settle(ctx.settle.after_move);
        let inspection = rig.camera.frame()?;
        trace_event!("pipette_retracted", retract = cfg.retract);
        let recal = Self {
            cfg,
            swapped: false,
            approach_steps: 0,
        };
        Ok((recal, inspection))
    }

    /// True until the operator has confirmed the swap.
    pub fn awaiting_swap(&self) -> bool {
        !self.swapped
    }

    /// Operator confirmation that the new pipette is mounted: advances the
    /// arm part of the way back.
    pub fn resume(&mut self, rig: &mut Rig<'_>, ctx: &TrackingContext<'_>) -> CalibResult<()> {
        if self.swapped {
            return Err(CalibError::InvalidInput("pipette swap already confirmed"));
        }
        rig.arm.relative_move(self.cfg.advance, SWAP_AXIS)?;
        rig.settle.settle(ctx.settle.after_move);
        self.swapped = true;
        trace_event!("pipette_swapped", advance = self.cfg.advance);
        Ok(())
    }

    /// Approach ticks taken so far.
    pub fn approach_steps(&self) -> usize {
        self.approach_steps
    }

    /// Advances the arm one approach step and, once the tip is visible,
    /// refocuses, recentres the stage and returns the new anchor.
    ///
    /// Does nothing before the swap is confirmed.
    pub fn tick(
        &mut self,
        rig: &mut Rig<'_>,
        ctx: &TrackingContext<'_>,
    ) -> CalibResult<RecalProgress> {
        if !self.swapped {
            return Ok(RecalProgress::AwaitingSwap);
        }
        let _span = trace_span!("recalibration", step = self.approach_steps).entered();
        rig.arm.relative_move(self.cfg.approach_step, SWAP_AXIS)?;
        rig.settle.settle(ctx.settle.after_move);

        let frame = rig.camera.frame()?;
        let tpl = ctx.template.view();
        let margin = 2 * self.cfg.zone_margin;
        let (zone, _) = frame
            .view()
            .centred_window(tpl.width() + margin, tpl.height() + margin)?;
        let seen = rig.matcher.locate(zone, ctx.template)?;
        if !seen.found {
            self.approach_steps += 1;
            if self.approach_steps >= self.cfg.max_approach_steps {
                trace_warn!("recalibration_tip_not_found", steps = self.approach_steps);
                return Err(CalibError::TrackingLost);
            }
            return Ok(RecalProgress::Approaching {
                steps: self.approach_steps,
            });
        }

        let focus = self.refocus(rig, ctx)?;
        let delta_px = focus.location - ctx.anchor.pixel;
        let correction = stage_compensation(&ctx.platform.alpha, ctx.platform.um_px, delta_px);
        rig.stage.relative_move(correction.x, 0)?;
        rig.stage.relative_move(correction.y, 1)?;
        rig.settle.settle(ctx.settle.after_move);

        let anchor = Anchor {
            arm: rig.arm.positions()?,
            stage: rig.stage.positions()?,
            pixel: ctx.anchor.pixel,
        };
        trace_event!(
            "recalibrated",
            score = focus.score,
            dx = correction.x,
            dy = correction.y
        );
        Ok(RecalProgress::Done { correction, anchor })
    }

    fn refocus(&self, rig: &mut Rig<'_>, ctx: &TrackingContext<'_>) -> CalibResult<FocusOutcome> {
        let direction = SweepDirection::for_step(self.cfg.approach_step);
        for attempt in 1..=self.cfg.max_refocus_attempts {
            let focus = ctx.focus.search(rig, ctx.template, direction)?;
            if focus.score >= self.cfg.accept_score {
                return Ok(focus);
            }
            trace_event!("refocus_rejected", attempt = attempt, score = focus.score);
        }
        Err(CalibError::FocusNotConverged {
            threshold: self.cfg.accept_score,
            attempts: self.cfg.max_refocus_attempts,
        })
    }
}
