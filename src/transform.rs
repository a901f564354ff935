//! Arm-to-stage displacement model.

use nalgebra::{Matrix3, Point2, Vector3};

use crate::trace::{trace_event, trace_warn};
use crate::util::{CalibError, CalibResult};

/// Determinants at or below this magnitude are treated as singular.
pub const SINGULAR_DETERMINANT: f64 = 1e-9;

/// Arm position, stage position and tip pixel recorded when calibration
/// starts; origin for every relative correction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Anchor {
    pub arm: Vector3<f64>,
    pub stage: Vector3<f64>,
    pub pixel: Point2<f64>,
}

/// 3x3 displacement-mapping matrix `M` and its cached inverse.
///
/// Column `i` is the stage displacement per unit displacement of arm axis `i`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransformModel {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl TransformModel {
    /// Builds the model from three axis estimates, inverting once.
    pub fn from_columns(columns: &[Vector3<f64>; 3]) -> CalibResult<Self> {
        Self::from_matrix(Matrix3::from_columns(&columns[..]))
    }

    /// Builds the model from a full matrix.
    pub fn from_matrix(matrix: Matrix3<f64>) -> CalibResult<Self> {
        let determinant = matrix.determinant();
        if !determinant.is_finite() || determinant.abs() <= SINGULAR_DETERMINANT {
            trace_warn!("transform_singular", determinant = determinant);
            return Err(CalibError::Inversion { determinant });
        }
        let inverse = matrix
            .try_inverse()
            .ok_or(CalibError::Inversion { determinant })?;
        trace_event!("transform_inverted", determinant = determinant);
        Ok(Self { matrix, inverse })
    }

    /// The matrix `M`.
    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// The cached inverse `M⁻¹`.
    pub fn inverse(&self) -> &Matrix3<f64> {
        &self.inverse
    }

    /// Stage displacement produced by an arm displacement: `M · d`.
    pub fn arm_to_stage(&self, displacement: &Vector3<f64>) -> Vector3<f64> {
        self.matrix * displacement
    }

    /// Arm displacement, relative to the anchor arm position, that places
    /// the stage at `target_stage`: `M⁻¹ · (target − anchor_stage)`.
    pub fn stage_to_arm_delta(
        &self,
        target_stage: &Vector3<f64>,
        anchor_stage: &Vector3<f64>,
    ) -> Vector3<f64> {
        self.inverse * (target_stage - anchor_stage)
    }
}

#[cfg(test)]
mod tests {
    use super::TransformModel;
    use crate::util::CalibError;
    use nalgebra::{Matrix3, Vector3};

    #[test]
    fn product_with_inverse_is_identity() {
        let columns = [
            Vector3::new(1.0, 0.2, -0.3),
            Vector3::new(0.1, 0.9, 0.4),
            Vector3::new(-0.5, 0.3, 1.2),
        ];
        let model = TransformModel::from_columns(&columns).unwrap();
        let product = model.matrix() * model.inverse();
        assert!((product - Matrix3::identity()).abs().max() < 1e-9);
    }

    #[test]
    fn identical_columns_fail_inversion() {
        let column = Vector3::new(0.3, -0.1, 0.8);
        let err = TransformModel::from_columns(&[column, column, Vector3::z()])
            .err()
            .unwrap();
        assert!(matches!(err, CalibError::Inversion { .. }));
    }

    #[test]
    fn stage_to_arm_delta_is_relative_to_anchor() {
        let model = TransformModel::from_matrix(Matrix3::from_diagonal(&Vector3::new(2.0, 4.0, 1.0)))
            .unwrap();
        let anchor = Vector3::new(10.0, 10.0, 10.0);
        let delta = model.stage_to_arm_delta(&Vector3::new(12.0, 6.0, 10.0), &anchor);
        assert!((delta - Vector3::new(1.0, -1.0, 0.0)).norm() < 1e-12);
        let back = model.arm_to_stage(&delta);
        assert!((back - Vector3::new(2.0, -4.0, 0.0)).norm() < 1e-12);
    }
}
