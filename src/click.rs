//! Converting a clicked pixel into an arm move.

use nalgebra::{Point2, Vector3};

use crate::device::Axes;
use crate::platform::PlatformCalibration;
use crate::transform::{Anchor, TransformModel};
use crate::util::CalibResult;

/// Arm move planned for a click: one absolute target per axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArmMove {
    /// Stage-frame displacement the click corresponds to.
    pub stage_delta: Vector3<f64>,
    /// Arm displacement relative to the anchor arm position.
    pub arm_delta: Vector3<f64>,
    /// Absolute arm targets (`anchor.arm + arm_delta`).
    pub targets: Vector3<f64>,
}

impl ArmMove {
    /// Issues one absolute move per arm axis. No post-move verification.
    pub fn apply(&self, arm: &mut dyn Axes) -> CalibResult<()> {
        arm.move_to(&self.targets)
    }
}

/// Plans the arm move that brings the tip to `pixel`.
///
/// The pixel offset from the anchor pixel is scaled by `um_px`, projected
/// through `alpha` onto the stage plane and mapped back to the arm with
/// `M⁻¹`. Pure: depends only on its arguments.
pub fn plan_click_move(
    pixel: Point2<f64>,
    transform: &TransformModel,
    platform: &PlatformCalibration,
    anchor: &Anchor,
) -> ArmMove {
    let planar = platform.pixel_to_stage(pixel - anchor.pixel);
    let stage_delta = Vector3::new(planar.x, planar.y, 0.0);
    let arm_delta = transform.stage_to_arm_delta(&(anchor.stage + stage_delta), &anchor.stage);
    ArmMove {
        stage_delta,
        arm_delta,
        targets: anchor.arm + arm_delta,
    }
}

#[cfg(test)]
mod tests {
    use super::plan_click_move;
    use crate::platform::PlatformCalibration;
    use crate::transform::{Anchor, TransformModel};
    use nalgebra::{Matrix2, Matrix3, Point2, Vector3};

    fn anchor() -> Anchor {
        Anchor {
            arm: Vector3::new(100.0, 200.0, 300.0),
            stage: Vector3::new(-5.0, 7.0, 40.0),
            pixel: Point2::new(320.0, 240.0),
        }
    }

    #[test]
    fn clicking_anchor_pixel_is_a_null_move() {
        let transform = TransformModel::from_matrix(Matrix3::new(
            0.9, 0.1, 0.0, //
            -0.2, 1.1, 0.3, //
            0.0, 0.2, 1.0,
        ))
        .unwrap();
        let platform = PlatformCalibration {
            alpha: Matrix2::new(0.0, 1.0, -1.0, 0.0),
            um_px: 1.7,
        };
        let anchor = anchor();
        let planned = plan_click_move(anchor.pixel, &transform, &platform, &anchor);
        assert!(planned.arm_delta.norm() < 1e-12);
        assert!((planned.targets - anchor.arm).norm() < 1e-12);
    }

    #[test]
    fn identity_calibration_moves_arm_by_stage_offset() {
        let transform = TransformModel::from_matrix(Matrix3::identity()).unwrap();
        let platform = PlatformCalibration {
            alpha: Matrix2::identity(),
            um_px: 0.5,
        };
        let anchor = anchor();
        let pixel = anchor.pixel + nalgebra::Vector2::new(20.0, 10.0);
        let planned = plan_click_move(pixel, &transform, &platform, &anchor);
        assert!((planned.arm_delta - Vector3::new(10.0, 5.0, 0.0)).norm() < 1e-12);
        assert!((planned.targets - Vector3::new(110.0, 205.0, 300.0)).norm() < 1e-12);
    }
}
