//! Platform calibration: pixel scale and camera-to-stage rotation.
//!
//! Two orthogonal stage probes of known length are observed through the
//! tracked tip. The pixel length of the first probe gives `um_px`; the pixel
//! direction of each probe gives one row of `alpha`.

use std::time::Duration;

use nalgebra::{Matrix2, Point2, Vector2};

use crate::device::Rig;
use crate::template::Template;
use crate::trace::{trace_event, trace_span};
use crate::util::math::pixel_to_stage;
use crate::util::{CalibError, CalibResult};

/// Stage probe parameters.
#[derive(Clone, Copy, Debug)]
pub struct PlatformConfig {
    /// Length of each stage probe in physical units.
    pub probe_distance: f64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            probe_distance: 100.0,
        }
    }
}

/// Pixel scale and pixel-to-stage projection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlatformCalibration {
    /// Maps a pixel-frame displacement (in physical units) to the stage plane.
    pub alpha: Matrix2<f64>,
    /// Physical distance per pixel.
    pub um_px: f64,
}

impl PlatformCalibration {
    /// Derives the calibration from the pixel displacements seen for an X
    /// probe and a Y probe, each `distance` long.
    pub fn from_probes(
        x_probe_px: Vector2<f64>,
        y_probe_px: Vector2<f64>,
        distance: f64,
    ) -> CalibResult<Self> {
        if distance == 0.0 {
            return Err(CalibError::InvalidInput("probe distance must be non-zero"));
        }
        let pixels = x_probe_px.norm();
        if pixels <= f64::EPSILON {
            return Err(CalibError::InvalidInput(
                "stage probe produced no pixel displacement",
            ));
        }
        let um_px = distance.abs() / pixels;
        let row0 = x_probe_px * (um_px / distance);
        let row1 = y_probe_px * (um_px / distance);
        Ok(Self {
            alpha: Matrix2::new(row0.x, row0.y, row1.x, row1.y),
            um_px,
        })
    }

    /// Stage-plane displacement corresponding to a pixel displacement.
    pub fn pixel_to_stage(&self, delta_px: Vector2<f64>) -> Vector2<f64> {
        pixel_to_stage(&self.alpha, self.um_px, delta_px)
    }
}

/// Probes the stage along X then Y, restoring it after each probe.
///
/// `anchor_px` is the tip location before probing; `template` is the
/// in-focus tip template.
pub fn calibrate_platform(
    rig: &mut Rig<'_>,
    template: &Template,
    anchor_px: Point2<f64>,
    cfg: &PlatformConfig,
    settle: Duration,
) -> CalibResult<PlatformCalibration> {
    let _span = trace_span!("platform_calibration", distance = cfg.probe_distance).entered();
    let mut probes = [Vector2::zeros(); 2];
    for (axis, probe) in probes.iter_mut().enumerate() {
        rig.stage.relative_move(cfg.probe_distance, axis)?;
        rig.settle.settle(settle);
        let frame = rig.camera.frame()?;
        let found = rig.matcher.locate(frame.view(), template)?;
        *probe = found.location - anchor_px;

        rig.stage.relative_move(-cfg.probe_distance, axis)?;
        rig.settle.settle(settle);
        trace_event!("stage_probe", axis = axis, dx = probe.x, dy = probe.y);
    }

    let platform = PlatformCalibration::from_probes(probes[0], probes[1], cfg.probe_distance)?;
    trace_event!("platform_calibrated", um_px = platform.um_px);
    Ok(platform)
}

#[cfg(test)]
mod tests {
    use super::PlatformCalibration;
    use nalgebra::Vector2;

    #[test]
    fn probe_of_fifty_pixels_gives_two_units_per_pixel() {
        let platform =
            PlatformCalibration::from_probes(Vector2::new(50.0, 0.0), Vector2::new(0.0, 50.0), 100.0)
                .unwrap();
        assert!((platform.um_px - 2.0).abs() < 1e-12);
        assert!((platform.alpha[(0, 0)] - 1.0).abs() < 1e-12);
        assert!(platform.alpha[(0, 1)].abs() < 1e-12);
        assert!((platform.alpha[(1, 1)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rotated_probes_fill_alpha_rows() {
        let platform =
            PlatformCalibration::from_probes(Vector2::new(0.0, -25.0), Vector2::new(25.0, 0.0), 100.0)
                .unwrap();
        assert!((platform.um_px - 4.0).abs() < 1e-12);
        assert!(platform.alpha[(0, 0)].abs() < 1e-12);
        assert!((platform.alpha[(0, 1)] + 1.0).abs() < 1e-12);
        assert!((platform.alpha[(1, 0)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn motionless_probe_is_rejected() {
        assert!(PlatformCalibration::from_probes(Vector2::zeros(), Vector2::zeros(), 100.0).is_err());
    }
}
