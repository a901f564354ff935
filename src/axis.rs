//! Per-axis Jacobian estimation.
//!
//! One arm axis is driven through growing test moves while the stage follows
//! the tip: it is recentred in X/Y from the running estimate, refocused with
//! the [`FocusSearcher`](crate::focus::FocusSearcher), then corrected for the
//! residual pixel error. The running estimate is refined after every retry.
//! Once the last retry is done the column is recomputed from the net stage
//! displacement over the net arm displacement, and both devices return to the
//! anchor.

use nalgebra::Vector3;

use crate::device::{Rig, Z_AXIS};
use crate::focus::SweepDirection;
use crate::trace::{trace_event, trace_span};
use crate::tracking::TrackingContext;
use crate::util::math::stage_compensation;
use crate::util::{CalibError, CalibResult};

/// Stage displacement per unit arm displacement for one arm axis.
pub type AxisEstimate = Vector3<f64>;

/// Test-move schedule.
#[derive(Clone, Copy, Debug)]
pub struct AxisConfig {
    /// First arm step; doubles after every retry.
    pub initial_step: f64,
    /// Number of test moves per axis.
    pub retries: usize,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            initial_step: 2.0,
            retries: 9,
        }
    }
}

/// In-progress calibration of one arm axis.
#[derive(Clone, Debug)]
pub struct AxisCalibrator {
    axis: usize,
    cfg: AxisConfig,
    retry: usize,
    step: f64,
    running: Vector3<f64>,
}

impl AxisCalibrator {
    pub fn new(axis: usize, cfg: AxisConfig) -> CalibResult<Self> {
        if axis >= 3 {
            return Err(CalibError::InvalidInput("arm axis must be 0, 1 or 2"));
        }
        if cfg.retries == 0 {
            return Err(CalibError::InvalidInput("axis calibration needs at least one retry"));
        }
        if cfg.initial_step == 0.0 || !cfg.initial_step.is_finite() {
            return Err(CalibError::InvalidInput("initial arm step must be finite and non-zero"));
        }
        Ok(Self {
            axis,
            cfg,
            retry: 0,
            step: cfg.initial_step,
            running: Vector3::zeros(),
        })
    }

    /// Arm axis under calibration.
    pub fn axis(&self) -> usize {
        self.axis
    }

    /// Retries completed so far.
    pub fn retry(&self) -> usize {
        self.retry
    }

    /// Arm step used by the next retry.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Cumulative estimate refined after each retry.
    pub fn running_estimate(&self) -> &Vector3<f64> {
        &self.running
    }

    /// Performs the next test move. After the final one, returns the net
    /// displacement estimate and restores arm and stage to the anchor.
    pub fn advance(
        &mut self,
        rig: &mut Rig<'_>,
        ctx: &TrackingContext<'_>,
    ) -> CalibResult<Option<AxisEstimate>> {
        if self.retry >= self.cfg.retries {
            return Err(CalibError::InvalidInput("axis calibration already finished"));
        }
        self.track(rig, ctx)?;
        self.retry += 1;
        if self.retry < self.cfg.retries {
            self.step *= 2.0;
            return Ok(None);
        }

        let column = self.net_estimate(rig, ctx)?;
        self.running = Vector3::zeros();
        self.step = self.cfg.initial_step;
        Ok(Some(column))
    }

    fn track(&mut self, rig: &mut Rig<'_>, ctx: &TrackingContext<'_>) -> CalibResult<()> {
        let _span = trace_span!("axis_retry", axis = self.axis, retry = self.retry, step = self.step)
            .entered();
        let step = self.step;
        let platform = ctx.platform;
        let z0 = rig.stage.position(Z_AXIS)?;

        let frame = rig.camera.frame()?;
        let initial = rig.matcher.locate(frame.view(), ctx.template)?.location;

        rig.arm.relative_move(step, self.axis)?;
        rig.settle.settle(ctx.settle.after_move);

        // Follow the expected drift before measuring.
        let precentre = stage_compensation(&platform.alpha, 1.0, self.running.xy() * step);
        rig.stage.relative_move(precentre.x, 0)?;
        rig.stage.relative_move(precentre.y, 1)?;
        rig.settle.settle(ctx.settle.after_move);
        rig.stage.absolute_move(z0 + self.running.z * step, Z_AXIS)?;

        let focus = ctx
            .focus
            .search(rig, ctx.template, SweepDirection::for_step(step))?;

        let delta_px = focus.location - initial;
        let correction = stage_compensation(&platform.alpha, platform.um_px, delta_px);
        rig.stage.relative_move(correction.x, 0)?;
        rig.stage.relative_move(correction.y, 1)?;
        rig.settle.settle(ctx.settle.after_move);

        self.running.z += focus.height_offset / step;
        self.running.x += delta_px.x * platform.um_px / step;
        self.running.y += delta_px.y * platform.um_px / step;
        trace_event!(
            "axis_retry_done",
            score = focus.score,
            height_offset = focus.height_offset,
            dx_px = delta_px.x,
            dy_px = delta_px.y
        );
        Ok(())
    }

    fn net_estimate(&self, rig: &mut Rig<'_>, ctx: &TrackingContext<'_>) -> CalibResult<AxisEstimate> {
        let arm = rig.arm.positions()?;
        let stage = rig.stage.positions()?;
        let travel = arm[self.axis] - ctx.anchor.arm[self.axis];
        if travel.abs() <= f64::EPSILON {
            return Err(CalibError::InvalidInput("arm did not move during axis calibration"));
        }
        let column = (stage - ctx.anchor.stage) / travel;

        rig.arm.move_to(&ctx.anchor.arm)?;
        rig.stage.move_to(&ctx.anchor.stage)?;
        rig.settle.settle(ctx.settle.after_restore);
        trace_event!(
            "axis_column",
            axis = self.axis,
            x = column.x,
            y = column.y,
            z = column.z
        );
        Ok(column)
    }
}

/// Runs every retry of one axis calibration and returns the final column.
///
/// A `TrackingLost` from any focus search aborts the axis; the partial
/// estimate is dropped and nothing is restored.
pub fn estimate_axis(
    rig: &mut Rig<'_>,
    ctx: &TrackingContext<'_>,
    axis: usize,
    cfg: AxisConfig,
) -> CalibResult<AxisEstimate> {
    let _span = trace_span!("axis_calibration", axis = axis).entered();
    let mut calibrator = AxisCalibrator::new(axis, cfg)?;
    loop {
        if let Some(column) = calibrator.advance(rig, ctx)? {
            return Ok(column);
        }
    }
}
