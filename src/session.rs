//! Calibration state machine and the operator-facing session object.
//!
//! A [`Calibrator`] is advanced one step per control-loop tick:
//!
//! ```text
//! IDLE -> PLATFORM_CAL -> AXIS_CAL(0) -> AXIS_CAL(1) -> AXIS_CAL(2) -> FINALIZE -> CALIBRATED
//! ```
//!
//! Each axis calibration takes one tick per test move. Any error raised while
//! calibrating drops the in-progress session and returns to `IDLE`; the
//! committed calibration from an earlier successful run is only replaced by a
//! successful finalize.

use nalgebra::{Matrix2, Matrix3, Point2, Vector3};

use crate::axis::{AxisCalibrator, AxisConfig};
use crate::click::{plan_click_move, ArmMove};
use crate::device::{Rig, SettleConfig};
use crate::focus::{FocusConfig, FocusOutcome, FocusSearcher, SweepDirection};
use crate::image::OwnedImage;
use crate::platform::{calibrate_platform, PlatformCalibration, PlatformConfig};
use crate::recalibrate::{RecalConfig, RecalProgress, Recalibration};
use crate::template::{TemplateConfig, TemplateSeries};
use crate::trace::{trace_event, trace_span, trace_warn};
use crate::tracking::TrackingContext;
use crate::transform::{Anchor, TransformModel};
use crate::util::{CalibError, CalibResult};

/// Every tunable of the calibration engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct CalibConfig {
    pub template: TemplateConfig,
    pub platform: PlatformConfig,
    pub axis: AxisConfig,
    pub focus: FocusConfig,
    pub recal: RecalConfig,
    pub settle: SettleConfig,
}

/// Public tag of the calibration state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PlatformCal,
    AxisCal(usize),
    Finalize,
    Calibrated,
}

/// Data gathered by an in-progress calibration; discarded on cancel or error.
#[derive(Clone, Debug)]
struct CalibrationSession {
    anchor: Anchor,
    templates: TemplateSeries,
    platform: PlatformCalibration,
    columns: [Vector3<f64>; 3],
}

impl CalibrationSession {
    fn context<'a>(&'a self, focus: &'a FocusSearcher, settle: &'a SettleConfig) -> TrackingContext<'a> {
        TrackingContext {
            template: self.templates.central(),
            platform: &self.platform,
            anchor: &self.anchor,
            focus,
            settle,
        }
    }
}

enum CalibrationState {
    Idle,
    PlatformCal,
    AxisCal {
        axis: usize,
        calibrator: AxisCalibrator,
        session: Box<CalibrationSession>,
    },
    Finalize {
        session: Box<CalibrationSession>,
    },
    Calibrated,
}

impl CalibrationState {
    fn phase(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::PlatformCal => Phase::PlatformCal,
            Self::AxisCal { axis, .. } => Phase::AxisCal(*axis),
            Self::Finalize { .. } => Phase::Finalize,
            Self::Calibrated => Phase::Calibrated,
        }
    }
}

/// Result of a successful calibration run.
#[derive(Clone, Debug)]
pub struct Calibration {
    pub transform: TransformModel,
    pub platform: PlatformCalibration,
    pub anchor: Anchor,
    pub templates: TemplateSeries,
}

impl Calibration {
    fn context<'a>(&'a self, focus: &'a FocusSearcher, settle: &'a SettleConfig) -> TrackingContext<'a> {
        TrackingContext {
            template: self.templates.central(),
            platform: &self.platform,
            anchor: &self.anchor,
            focus,
            settle,
        }
    }

    /// Plans the arm move that brings the tip to `pixel`.
    pub fn plan_click_move(&self, pixel: Point2<f64>) -> ArmMove {
        plan_click_move(pixel, &self.transform, &self.platform, &self.anchor)
    }
}

/// Snapshot for a click dispatcher or a status display.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Status {
    pub phase: Phase,
    pub calibrated: bool,
    pub recalibrating: bool,
    /// A swap was triggered and the operator has not confirmed it yet.
    pub awaiting_swap: bool,
    pub matrix: Option<Matrix3<f64>>,
    pub inverse: Option<Matrix3<f64>>,
    pub anchor: Option<Anchor>,
    pub alpha: Option<Matrix2<f64>>,
    pub um_px: Option<f64>,
}

/// What a tick did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Progress {
    /// Nothing to do.
    Idle,
    /// The platform was calibrated; axis 0 is next.
    PlatformCalibrated,
    /// One test move of an axis was performed.
    Tracking { axis: usize, retry: usize },
    /// An axis column was estimated.
    AxisCalibrated { axis: usize, column: Vector3<f64> },
    /// The transform was inverted and committed.
    Calibrated,
    /// Retracted for a swap; nothing moves until it is confirmed.
    AwaitingSwap,
    /// Still looking for the new tip after a swap.
    Recalibrating { steps: usize },
    /// The anchor was updated after a swap.
    Recalibrated,
}

/// Explicit session object handed every operator event and every tick.
pub struct Calibrator {
    cfg: CalibConfig,
    focus: FocusSearcher,
    state: CalibrationState,
    committed: Option<Calibration>,
    recal: Option<Recalibration>,
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new(CalibConfig::default())
    }
}

impl Calibrator {
    pub fn new(cfg: CalibConfig) -> Self {
        Self {
            cfg,
            focus: FocusSearcher::new(cfg.focus),
            state: CalibrationState::Idle,
            committed: None,
            recal: None,
        }
    }

    pub fn config(&self) -> &CalibConfig {
        &self.cfg
    }

    /// Current state tag.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// True when a committed calibration exists and no new run is in progress.
    pub fn is_calibrated(&self) -> bool {
        self.committed.is_some() && matches!(self.state, CalibrationState::Idle | CalibrationState::Calibrated)
    }

    /// Committed calibration, if usable.
    pub fn calibration(&self) -> Option<&Calibration> {
        if self.is_calibrated() {
            self.committed.as_ref()
        } else {
            None
        }
    }

    fn require_calibration(&self) -> CalibResult<&Calibration> {
        self.calibration().ok_or(CalibError::NotCalibrated)
    }

    pub fn status(&self) -> Status {
        let calibration = self.calibration();
        Status {
            phase: self.phase(),
            calibrated: calibration.is_some(),
            recalibrating: self.recal.is_some(),
            awaiting_swap: self.recal.as_ref().is_some_and(Recalibration::awaiting_swap),
            matrix: calibration.map(|c| *c.transform.matrix()),
            inverse: calibration.map(|c| *c.transform.inverse()),
            anchor: calibration.map(|c| c.anchor),
            alpha: calibration.map(|c| c.platform.alpha),
            um_px: calibration.map(|c| c.platform.um_px),
        }
    }

    /// Starts (or restarts) a calibration run from any state.
    pub fn begin_calibration(&mut self) {
        trace_event!("calibration_begin");
        self.recal = None;
        self.state = CalibrationState::PlatformCal;
    }

    /// Abandons an in-progress run or recalibration. Moves already issued are
    /// not rolled back; a previously committed calibration stays in place.
    pub fn cancel_calibration(&mut self) {
        trace_event!("calibration_cancel");
        self.recal = None;
        self.state = CalibrationState::Idle;
    }

    /// Advances the state machine (or an active recalibration) by one step.
    pub fn tick(&mut self, rig: &mut Rig<'_>) -> CalibResult<Progress> {
        if self.recal.is_some() {
            return self.tick_recalibration(rig);
        }
        let result = self.tick_calibration(rig);
        if let Err(err) = &result {
            trace_warn!("calibration_aborted", error = err.to_string().as_str());
        }
        result
    }

    fn tick_calibration(&mut self, rig: &mut Rig<'_>) -> CalibResult<Progress> {
        // Taking the state leaves IDLE behind if anything below fails.
        let state = std::mem::replace(&mut self.state, CalibrationState::Idle);
        match state {
            CalibrationState::Idle => Ok(Progress::Idle),
            CalibrationState::Calibrated => {
                self.state = CalibrationState::Calibrated;
                Ok(Progress::Idle)
            }
            CalibrationState::PlatformCal => {
                let session = self.start_session(rig)?;
                self.state = CalibrationState::AxisCal {
                    axis: 0,
                    calibrator: AxisCalibrator::new(0, self.cfg.axis)?,
                    session: Box::new(session),
                };
                Ok(Progress::PlatformCalibrated)
            }
            CalibrationState::AxisCal {
                axis,
                mut calibrator,
                mut session,
            } => {
                let column = {
                    let ctx = session.context(&self.focus, &self.cfg.settle);
                    calibrator.advance(rig, &ctx)?
                };
                let Some(column) = column else {
                    let retry = calibrator.retry();
                    self.state = CalibrationState::AxisCal {
                        axis,
                        calibrator,
                        session,
                    };
                    return Ok(Progress::Tracking { axis, retry });
                };

                session.columns[axis] = column;
                self.state = if axis + 1 < 3 {
                    CalibrationState::AxisCal {
                        axis: axis + 1,
                        calibrator: AxisCalibrator::new(axis + 1, self.cfg.axis)?,
                        session,
                    }
                } else {
                    CalibrationState::Finalize { session }
                };
                Ok(Progress::AxisCalibrated { axis, column })
            }
            CalibrationState::Finalize { session } => {
                let transform = TransformModel::from_columns(&session.columns)?;
                let session = *session;
                self.committed = Some(Calibration {
                    transform,
                    platform: session.platform,
                    anchor: session.anchor,
                    templates: session.templates,
                });
                self.state = CalibrationState::Calibrated;
                trace_event!("calibration_finished");
                Ok(Progress::Calibrated)
            }
        }
    }

    fn start_session(&self, rig: &mut Rig<'_>) -> CalibResult<CalibrationSession> {
        let _span = trace_span!("calibration_start").entered();
        let arm = rig.arm.positions()?;
        let stage = rig.stage.positions()?;
        let templates = TemplateSeries::capture(rig, &self.cfg.template, self.cfg.settle.after_move)?;

        let frame = rig.camera.frame()?;
        let seen = rig.matcher.locate(frame.view(), templates.central())?;
        if !seen.found {
            return Err(CalibError::TrackingLost);
        }
        let anchor = Anchor {
            arm,
            stage,
            pixel: seen.location,
        };

        let platform = calibrate_platform(
            rig,
            templates.central(),
            anchor.pixel,
            &self.cfg.platform,
            self.cfg.settle.after_move,
        )?;
        Ok(CalibrationSession {
            anchor,
            templates,
            platform,
            columns: [Vector3::zeros(); 3],
        })
    }

    /// Starts a pipette swap by retracting the arm. Returns the frame taken
    /// at the retracted position; once the operator confirms the swap with
    /// [`Calibrator::confirm_swap`], the following ticks re-anchor the
    /// calibration.
    pub fn trigger_recalibration(&mut self, rig: &mut Rig<'_>) -> CalibResult<OwnedImage> {
        let calibration = self.require_calibration()?;
        let ctx = calibration.context(&self.focus, &self.cfg.settle);
        let (recal, inspection) = Recalibration::trigger(rig, self.cfg.recal, &ctx)?;
        self.recal = Some(recal);
        Ok(inspection)
    }

    /// Operator confirmation that the new pipette is mounted.
    pub fn confirm_swap(&mut self, rig: &mut Rig<'_>) -> CalibResult<()> {
        let (Some(recal), Some(calibration)) = (self.recal.as_mut(), self.committed.as_ref()) else {
            return Err(CalibError::InvalidInput("no pipette swap in progress"));
        };
        if !recal.awaiting_swap() {
            return Err(CalibError::InvalidInput("pipette swap already confirmed"));
        }
        let ctx = calibration.context(&self.focus, &self.cfg.settle);
        let result = recal.resume(rig, &ctx);
        if let Err(err) = &result {
            trace_warn!("recalibration_aborted", error = err.to_string().as_str());
            self.recal = None;
        }
        result
    }

    fn tick_recalibration(&mut self, rig: &mut Rig<'_>) -> CalibResult<Progress> {
        let (Some(recal), Some(calibration)) = (self.recal.as_mut(), self.committed.as_mut()) else {
            return Ok(Progress::Idle);
        };
        let ctx = calibration.context(&self.focus, &self.cfg.settle);
        match recal.tick(rig, &ctx) {
            Ok(RecalProgress::AwaitingSwap) => Ok(Progress::AwaitingSwap),
            Ok(RecalProgress::Approaching { steps }) => Ok(Progress::Recalibrating { steps }),
            Ok(RecalProgress::Done { anchor, .. }) => {
                calibration.anchor = anchor;
                self.recal = None;
                Ok(Progress::Recalibrated)
            }
            Err(err) => {
                trace_warn!("recalibration_aborted", error = err.to_string().as_str());
                self.recal = None;
                Err(err)
            }
        }
    }

    /// Plans the click move without touching any device.
    pub fn plan_move_to_pixel(&self, pixel: Point2<f64>) -> CalibResult<ArmMove> {
        Ok(self.require_calibration()?.plan_click_move(pixel))
    }

    /// Moves the arm so that the tip lands on `pixel`.
    pub fn move_to_pixel(&self, rig: &mut Rig<'_>, pixel: Point2<f64>) -> CalibResult<ArmMove> {
        let planned = self.plan_move_to_pixel(pixel)?;
        planned.apply(&mut *rig.arm)?;
        trace_event!("click_move", x = pixel.x, y = pixel.y);
        Ok(planned)
    }

    /// Stage displacement for an arm displacement.
    pub fn arm_to_stage(&self, displacement: &Vector3<f64>) -> CalibResult<Vector3<f64>> {
        Ok(self.require_calibration()?.transform.arm_to_stage(displacement))
    }

    /// Arm displacement from the anchor that places the stage at `target`.
    pub fn stage_to_arm_delta(&self, target_stage: &Vector3<f64>) -> CalibResult<Vector3<f64>> {
        let calibration = self.require_calibration()?;
        Ok(calibration
            .transform
            .stage_to_arm_delta(target_stage, &calibration.anchor.stage))
    }

    /// Brings the tip back under the objective after the operator moved the
    /// stage. Returns the absolute arm targets.
    pub fn follow_stage(&self, rig: &mut Rig<'_>) -> CalibResult<Vector3<f64>> {
        let calibration = self.require_calibration()?;
        let stage = rig.stage.positions()?;
        let targets = calibration.anchor.arm
            + calibration
                .transform
                .stage_to_arm_delta(&stage, &calibration.anchor.stage);
        rig.arm.move_to(&targets)?;
        Ok(targets)
    }

    /// Refocuses on the tip with the in-focus template.
    pub fn autofocus(&self, rig: &mut Rig<'_>) -> CalibResult<FocusOutcome> {
        let calibration = self.require_calibration()?;
        self.focus
            .search(rig, calibration.templates.central(), SweepDirection::Backward)
    }
}
