//! Small linear-algebra helpers shared by the calibration stages.

use nalgebra::{Matrix2, Vector2};

/// Maps a pixel-frame displacement to a stage-plane displacement.
///
/// `alpha` projects physical pixel-frame offsets onto the stage axes, `um_px`
/// converts pixels to physical units.
pub(crate) fn pixel_to_stage(alpha: &Matrix2<f64>, um_px: f64, delta_px: Vector2<f64>) -> Vector2<f64> {
    alpha * (delta_px * um_px)
}

/// Stage move that brings a tip displaced by `delta_px` back to where it was.
pub(crate) fn stage_compensation(
    alpha: &Matrix2<f64>,
    um_px: f64,
    delta_px: Vector2<f64>,
) -> Vector2<f64> {
    -pixel_to_stage(alpha, um_px, delta_px)
}

#[cfg(test)]
mod tests {
    use super::{pixel_to_stage, stage_compensation};
    use nalgebra::{Matrix2, Vector2};

    #[test]
    fn pixel_to_stage_scales_then_projects() {
        let alpha = Matrix2::new(0.0, -1.0, 1.0, 0.0);
        let out = pixel_to_stage(&alpha, 2.0, Vector2::new(3.0, 1.0));
        assert!((out.x + 2.0).abs() < 1e-12);
        assert!((out.y - 6.0).abs() < 1e-12);
    }

    #[test]
    fn compensation_opposes_projection() {
        let alpha = Matrix2::identity();
        let out = stage_compensation(&alpha, 0.5, Vector2::new(4.0, -2.0));
        assert!((out.x + 2.0).abs() < 1e-12);
        assert!((out.y - 1.0).abs() < 1e-12);
    }
}
