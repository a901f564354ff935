//! Simulated rig for running the calibration without hardware.
//!
//! [`SimRig`] shares one world model between a simulated arm, stage, camera,
//! matcher and settle clock. The tip sits at `jacobian · arm + tip_offset` in
//! stage coordinates; the camera rides on the stage, so the tip shows up at
//! `centre + P · (tip − stage − origin)` in pixels and is sharp when the
//! tip-to-stage height equals the focus height. Origin and focus height are
//! taken at construction, so the rig starts centred and in focus. The matcher
//! scores a template by how far the current defocus is from the defocus the
//! template was captured at, and only sees the tip inside the (centred) view
//! it is given. Frames show a textured tip patch on a flat background, so a
//! real matcher can be plugged in with [`SimRig::rig_with_matcher`]; focus is
//! not rendered.
//!
//! The scripted parts ([`ScriptedMatcher`], [`MemoryAxes`], [`StaticCamera`])
//! replay fixed answers for tests that need exact control over scores.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use nalgebra::{Matrix2, Matrix3, Point2, Rotation2, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::device::{Axes, Camera, Rig, Settle};
use crate::image::{ImageView, OwnedImage};
use crate::matcher::{MatchResult, VisionMatcher};
use crate::template::Template;
use crate::util::{CalibError, CalibResult};

/// Half-size of the textured tip patch drawn into frames.
const TIP_RADIUS: i64 = 8;
const BACKGROUND: u8 = 40;

/// Parameters of the simulated world.
#[derive(Clone, Copy, Debug)]
pub struct SimConfig {
    /// True tip displacement (stage frame) per unit arm displacement.
    pub jacobian: Matrix3<f64>,
    /// Physical distance per pixel.
    pub um_px: f64,
    /// Rotation of the camera relative to the stage axes, in degrees.
    pub camera_rotation_deg: f64,
    /// Pixel at the frame centre, where the tip sits when level with the stage.
    pub image_centre: Point2<f64>,
    /// Score lost per unit of defocus.
    pub focus_falloff: f64,
    /// Scores below this are reported as not found.
    pub found_threshold: f64,
    /// Half-width of the uniform pixel noise added to every location.
    pub noise_px: f64,
    pub seed: u64,
    pub frame_size: (usize, usize),
    pub arm_start: Vector3<f64>,
    pub stage_start: Vector3<f64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            jacobian: Matrix3::identity(),
            um_px: 2.0,
            camera_rotation_deg: 0.0,
            image_centre: Point2::new(160.0, 120.0),
            focus_falloff: 0.15,
            found_threshold: 0.3,
            noise_px: 0.0,
            seed: 7,
            frame_size: (320, 240),
            arm_start: Vector3::zeros(),
            stage_start: Vector3::zeros(),
        }
    }
}

/// Ground truth shared by the simulated devices.
pub struct SimWorld {
    pub arm: Vector3<f64>,
    pub stage: Vector3<f64>,
    pub jacobian: Matrix3<f64>,
    /// Tip position at zero arm displacement; a pipette swap changes it.
    pub tip_offset: Vector3<f64>,
    pub pixel_from_stage: Matrix2<f64>,
    pub image_centre: Point2<f64>,
    /// Tip-to-stage offset that images at `image_centre`.
    pub view_origin: Vector2<f64>,
    pub focus_height: f64,
    pub focus_falloff: f64,
    pub found_threshold: f64,
    pub noise_px: f64,
    /// When set, the matcher never reports a match.
    pub blind: bool,
    /// Total real time the engine asked to wait.
    pub settled: Duration,
    /// Every absolute arm target commanded, in order.
    pub arm_targets: Vec<(usize, f64)>,
    frame_size: (usize, usize),
    rng: StdRng,
}

impl SimWorld {
    fn new(cfg: &SimConfig) -> Self {
        let rotation = Rotation2::new(cfg.camera_rotation_deg.to_radians());
        let mut world = Self {
            arm: cfg.arm_start,
            stage: cfg.stage_start,
            jacobian: cfg.jacobian,
            tip_offset: Vector3::zeros(),
            pixel_from_stage: rotation.matrix() / cfg.um_px,
            image_centre: cfg.image_centre,
            view_origin: Vector2::zeros(),
            focus_height: 0.0,
            focus_falloff: cfg.focus_falloff,
            found_threshold: cfg.found_threshold,
            noise_px: cfg.noise_px,
            blind: false,
            settled: Duration::ZERO,
            arm_targets: Vec::new(),
            frame_size: cfg.frame_size,
            rng: StdRng::seed_from_u64(cfg.seed),
        };
        // The rig starts with the tip centred and sharp.
        world.view_origin = world.tip().xy() - world.stage.xy();
        world.focus_height = world.tip().z - world.stage.z;
        world
    }

    /// Tip position in stage coordinates.
    pub fn tip(&self) -> Vector3<f64> {
        self.jacobian * self.arm + self.tip_offset
    }

    /// Noise-free pixel location of the tip.
    pub fn tip_pixel(&self) -> Point2<f64> {
        let relative = self.tip().xy() - self.stage.xy() - self.view_origin;
        self.image_centre + self.pixel_from_stage * relative
    }

    /// Tip height relative to the focal plane.
    pub fn defocus(&self) -> f64 {
        self.tip().z - self.stage.z - self.focus_height
    }

    /// Scores `template` against a centred view of `width` x `height` pixels.
    fn observe(&mut self, template: &Template, width: usize, height: usize) -> MatchResult {
        let score = (1.0 - self.focus_falloff * (self.defocus() + template.height_offset()).abs())
            .max(0.0);
        let truth = self.tip_pixel();
        let offset = truth - self.image_centre;
        let visible = offset.x.abs() <= width as f64 / 2.0 && offset.y.abs() <= height as f64 / 2.0;
        let mut location = truth;
        if self.noise_px > 0.0 {
            let n = self.noise_px;
            location += Vector2::new(self.rng.random_range(-n..=n), self.rng.random_range(-n..=n));
        }
        MatchResult {
            found: visible && !self.blind && score >= self.found_threshold,
            score,
            location,
        }
    }

    fn render(&self) -> CalibResult<OwnedImage> {
        let (width, height) = self.frame_size;
        let tip = self.tip_pixel();
        let (tx, ty) = (tip.x.round() as i64, tip.y.round() as i64);
        let mut data = vec![BACKGROUND; width * height];
        for dy in -TIP_RADIUS..=TIP_RADIUS {
            for dx in -TIP_RADIUS..=TIP_RADIUS {
                let (x, y) = (tx + dx, ty + dy);
                if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
                    continue;
                }
                let (u, v) = (dx + TIP_RADIUS, dy + TIP_RADIUS);
                let texture = ((u * 37) ^ (v * 23) ^ (u * v)) % 160;
                data[y as usize * width + x as usize] = (90 + texture) as u8;
            }
        }
        OwnedImage::new(data, width, height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Device {
    Arm,
    Stage,
}

/// Simulated arm or stage.
pub struct SimAxes {
    world: Rc<RefCell<SimWorld>>,
    device: Device,
}

impl SimAxes {
    fn check(axis: usize) -> CalibResult<()> {
        if axis < 3 {
            Ok(())
        } else {
            Err(CalibError::device("sim", format!("no axis {axis}")))
        }
    }
}

impl Axes for SimAxes {
    fn position(&mut self, axis: usize) -> CalibResult<f64> {
        Self::check(axis)?;
        let world = self.world.borrow();
        Ok(match self.device {
            Device::Arm => world.arm[axis],
            Device::Stage => world.stage[axis],
        })
    }

    fn relative_move(&mut self, delta: f64, axis: usize) -> CalibResult<()> {
        Self::check(axis)?;
        let mut world = self.world.borrow_mut();
        match self.device {
            Device::Arm => world.arm[axis] += delta,
            Device::Stage => world.stage[axis] += delta,
        }
        Ok(())
    }

    fn absolute_move(&mut self, position: f64, axis: usize) -> CalibResult<()> {
        Self::check(axis)?;
        let mut world = self.world.borrow_mut();
        match self.device {
            Device::Arm => {
                world.arm[axis] = position;
                world.arm_targets.push((axis, position));
            }
            Device::Stage => world.stage[axis] = position,
        }
        Ok(())
    }
}

/// Simulated camera; frames carry a fixed texture.
pub struct SimCamera {
    world: Rc<RefCell<SimWorld>>,
}

impl Camera for SimCamera {
    fn frame(&mut self) -> CalibResult<OwnedImage> {
        self.world.borrow().render()
    }
}

/// Simulated matcher reading the tip state from the world.
pub struct SimMatcher {
    world: Rc<RefCell<SimWorld>>,
}

impl VisionMatcher for SimMatcher {
    fn locate(&mut self, frame: ImageView<'_, u8>, template: &Template) -> CalibResult<MatchResult> {
        Ok(self
            .world
            .borrow_mut()
            .observe(template, frame.width(), frame.height()))
    }
}

/// Settle clock that only accumulates the requested pauses.
pub struct SimClock {
    world: Rc<RefCell<SimWorld>>,
}

impl Settle for SimClock {
    fn settle(&mut self, duration: Duration) {
        self.world.borrow_mut().settled += duration;
    }
}

/// A complete simulated rig.
pub struct SimRig {
    world: Rc<RefCell<SimWorld>>,
    arm: SimAxes,
    stage: SimAxes,
    camera: SimCamera,
    matcher: SimMatcher,
    clock: SimClock,
}

impl SimRig {
    pub fn new(cfg: SimConfig) -> Self {
        let world = Rc::new(RefCell::new(SimWorld::new(&cfg)));
        Self {
            arm: SimAxes {
                world: Rc::clone(&world),
                device: Device::Arm,
            },
            stage: SimAxes {
                world: Rc::clone(&world),
                device: Device::Stage,
            },
            camera: SimCamera {
                world: Rc::clone(&world),
            },
            matcher: SimMatcher {
                world: Rc::clone(&world),
            },
            clock: SimClock {
                world: Rc::clone(&world),
            },
            world,
        }
    }

    /// Lends the simulated devices to the engine.
    pub fn rig(&mut self) -> Rig<'_> {
        Rig {
            arm: &mut self.arm,
            stage: &mut self.stage,
            camera: &mut self.camera,
            matcher: &mut self.matcher,
            settle: &mut self.clock,
        }
    }

    /// Lends the simulated devices with `matcher` in place of the simulated one.
    pub fn rig_with_matcher<'a>(&'a mut self, matcher: &'a mut dyn VisionMatcher) -> Rig<'a> {
        Rig {
            arm: &mut self.arm,
            stage: &mut self.stage,
            camera: &mut self.camera,
            matcher,
            settle: &mut self.clock,
        }
    }

    pub fn world(&self) -> Ref<'_, SimWorld> {
        self.world.borrow()
    }

    pub fn world_mut(&self) -> RefMut<'_, SimWorld> {
        self.world.borrow_mut()
    }
}

/// Matcher replaying a fixed sequence of scores, then a fallback.
///
/// A score of zero is reported as not found.
#[derive(Clone, Debug)]
pub struct ScriptedMatcher {
    scores: VecDeque<f64>,
    fallback: f64,
    location: Point2<f64>,
    calls: usize,
}

impl ScriptedMatcher {
    pub fn new(scores: impl IntoIterator<Item = f64>, fallback: f64) -> Self {
        Self {
            scores: scores.into_iter().collect(),
            fallback,
            location: Point2::origin(),
            calls: 0,
        }
    }

    /// Location reported with every score.
    pub fn at(mut self, location: Point2<f64>) -> Self {
        self.location = location;
        self
    }

    /// Number of `locate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl VisionMatcher for ScriptedMatcher {
    fn locate(&mut self, _frame: ImageView<'_, u8>, _template: &Template) -> CalibResult<MatchResult> {
        self.calls += 1;
        let score = self.scores.pop_front().unwrap_or(self.fallback);
        Ok(MatchResult {
            found: score > 0.0,
            score,
            location: self.location,
        })
    }
}

/// Three axes held in memory, with an optional failure after N commands.
#[derive(Clone, Debug, Default)]
pub struct MemoryAxes {
    pub position: Vector3<f64>,
    /// Every command as `(axis, value, absolute)`.
    pub commands: Vec<(usize, f64, bool)>,
    pub fail_after: Option<usize>,
}

impl MemoryAxes {
    pub fn at(position: Vector3<f64>) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    fn command(&mut self, axis: usize, value: f64, absolute: bool) -> CalibResult<()> {
        if axis >= 3 {
            return Err(CalibError::device("memory", format!("no axis {axis}")));
        }
        if self.fail_after.is_some_and(|limit| self.commands.len() >= limit) {
            return Err(CalibError::device("memory", "serial timeout"));
        }
        self.commands.push((axis, value, absolute));
        Ok(())
    }
}

impl Axes for MemoryAxes {
    fn position(&mut self, axis: usize) -> CalibResult<f64> {
        if axis >= 3 {
            return Err(CalibError::device("memory", format!("no axis {axis}")));
        }
        Ok(self.position[axis])
    }

    fn relative_move(&mut self, delta: f64, axis: usize) -> CalibResult<()> {
        self.command(axis, delta, false)?;
        self.position[axis] += delta;
        Ok(())
    }

    fn absolute_move(&mut self, position: f64, axis: usize) -> CalibResult<()> {
        self.command(axis, position, true)?;
        self.position[axis] = position;
        Ok(())
    }
}

/// Camera returning the same small textured frame every time.
#[derive(Clone, Debug)]
pub struct StaticCamera {
    pub width: usize,
    pub height: usize,
    pub frames: usize,
}

impl Default for StaticCamera {
    fn default() -> Self {
        Self {
            width: 16,
            height: 16,
            frames: 0,
        }
    }
}

impl Camera for StaticCamera {
    fn frame(&mut self) -> CalibResult<OwnedImage> {
        self.frames += 1;
        let data = (0..self.width * self.height).map(|i| (i % 251) as u8).collect();
        OwnedImage::new(data, self.width, self.height)
    }
}

/// Settle clock that does not wait.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSettle;

impl Settle for NoSettle {
    fn settle(&mut self, _duration: Duration) {}
}
