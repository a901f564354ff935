//! Hardware seams: motorized axes, camera, settle clock.
//!
//! The calibration engine never talks to a serial port or a frame grabber
//! directly. Drivers implement these traits and are lent to the engine for the
//! duration of one control-loop tick through a [`Rig`].

use std::time::Duration;

use nalgebra::Vector3;

use crate::image::OwnedImage;
use crate::matcher::VisionMatcher;
use crate::util::CalibResult;

/// Index of the focus (height) axis on the stage.
pub const Z_AXIS: usize = 2;

/// A three-axis motorized device (manipulator arm or microscope stage).
///
/// Axes are numbered 0..3 in the device's own coordinate frame. Positions and
/// moves are in the device's physical unit.
pub trait Axes {
    /// Current position along `axis`.
    fn position(&mut self, axis: usize) -> CalibResult<f64>;

    /// Moves `axis` by `delta`.
    fn relative_move(&mut self, delta: f64, axis: usize) -> CalibResult<()>;

    /// Moves `axis` to `position`.
    fn absolute_move(&mut self, position: f64, axis: usize) -> CalibResult<()>;

    /// Reads all three axes.
    fn positions(&mut self) -> CalibResult<Vector3<f64>> {
        Ok(Vector3::new(
            self.position(0)?,
            self.position(1)?,
            self.position(2)?,
        ))
    }

    /// Moves all three axes to `target`, one absolute move per axis.
    fn move_to(&mut self, target: &Vector3<f64>) -> CalibResult<()> {
        for axis in 0..3 {
            self.absolute_move(target[axis], axis)?;
        }
        Ok(())
    }
}

/// Source of live frames. Freshness is best effort.
pub trait Camera {
    fn frame(&mut self) -> CalibResult<OwnedImage>;
}

/// Blocking pause after a physical move, before the next frame is sampled.
pub trait Settle {
    fn settle(&mut self, duration: Duration);
}

/// Settles by sleeping the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleep;

impl Settle for ThreadSleep {
    fn settle(&mut self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Real-time pauses issued after moves.
#[derive(Clone, Copy, Debug)]
pub struct SettleConfig {
    /// Pause after an arm step or a stage correction.
    pub after_move: Duration,
    /// Pause after restoring arm and stage to the anchor.
    pub after_restore: Duration,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            after_move: Duration::from_secs(1),
            after_restore: Duration::from_secs(2),
        }
    }
}

/// Everything the engine drives during one tick.
pub struct Rig<'a> {
    pub arm: &'a mut dyn Axes,
    pub stage: &'a mut dyn Axes,
    pub camera: &'a mut dyn Camera,
    pub matcher: &'a mut dyn VisionMatcher,
    pub settle: &'a mut dyn Settle,
}
