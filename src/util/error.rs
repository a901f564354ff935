//! Error types for tipcal.

use thiserror::Error;

/// Result alias for tipcal operations.
pub type CalibResult<T> = std::result::Result<T, CalibError>;

/// Errors that can occur while calibrating or driving the rig.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CalibError {
    /// The template was never matched during a focus search.
    #[error("tracking lost: template never matched during focus search")]
    TrackingLost,
    /// The transform matrix could not be inverted.
    #[error("transform matrix is singular (determinant {determinant:e})")]
    Inversion { determinant: f64 },
    /// A transform or click move was requested before calibration finished.
    #[error("calibration must be done beforehand")]
    NotCalibrated,
    /// A manipulator, stage or camera call failed.
    #[error("{device} device error: {reason}")]
    Device { device: &'static str, reason: String },
    /// Repeated focus searches never reached the acceptance score.
    #[error("focus did not reach score {threshold} after {attempts} attempts")]
    FocusNotConverged { threshold: f64, attempts: usize },
    /// The input data or parameters are invalid.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Image dimensions are zero or overflow.
    #[error("invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },
    /// Stride is smaller than the row width.
    #[error("invalid stride {stride} for width {width}")]
    InvalidStride { width: usize, stride: usize },
    /// Backing buffer is shorter than the view requires.
    #[error("buffer too small: needed {needed}, got {got}")]
    BufferTooSmall { needed: usize, got: usize },
    /// Requested region does not fit inside the image.
    #[error("roi {width}x{height} at ({x}, {y}) exceeds image {img_width}x{img_height}")]
    RoiOutOfBounds {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        img_width: usize,
        img_height: usize,
    },
    /// Template cannot be correlated (e.g. constant intensity).
    #[error("degenerate template: {reason}")]
    DegenerateTemplate { reason: &'static str },
    /// Image decoding failed.
    #[error("image io: {reason}")]
    ImageIo { reason: String },
}

impl CalibError {
    /// Builds a device error for the named device.
    pub fn device(device: &'static str, reason: impl Into<String>) -> Self {
        Self::Device {
            device,
            reason: reason.into(),
        }
    }
}
