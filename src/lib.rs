//! Tipcal calibrates a pipette manipulator against a microscope stage.
//!
//! The engine estimates the 3x3 matrix mapping arm displacement to stage
//! displacement by tracking the tip through the camera, one arm axis at a
//! time, then uses it to turn clicked pixels into arm moves. Devices, camera
//! and the template matcher are injected through the traits in [`device`]
//! and [`matcher`]; a simulated rig lives in [`synthetic`].
//!
//! Optional features: `rayon` parallelises the ZNCC scan, `image-io` loads
//! frames from disk, `synthetic` (on by default) provides the simulated rig
//! and scripted test doubles, `tracing` emits spans and events for every stage.

pub mod axis;
pub mod click;
pub mod device;
pub mod focus;
pub mod image;
pub mod matcher;
pub mod platform;
pub mod recalibrate;
pub mod session;
#[cfg(feature = "synthetic")]
pub mod synthetic;
pub mod template;
mod trace;
pub mod tracking;
pub mod transform;
pub mod util;

pub use nalgebra;

pub use axis::{estimate_axis, AxisCalibrator, AxisConfig, AxisEstimate};
pub use click::{plan_click_move, ArmMove};
pub use device::{Axes, Camera, Rig, Settle, SettleConfig, ThreadSleep};
pub use focus::{FocusConfig, FocusOutcome, FocusSearcher, SweepDirection};
pub use image::{ImageView, OwnedImage};
pub use matcher::{MatchResult, VisionMatcher, ZnccConfig, ZnccMatcher};
pub use platform::{calibrate_platform, PlatformCalibration, PlatformConfig};
pub use recalibrate::{RecalConfig, RecalProgress, Recalibration};
pub use session::{CalibConfig, Calibration, Calibrator, Phase, Progress, Status};
pub use template::{Template, TemplateConfig, TemplatePlan, TemplateSeries};
pub use tracking::TrackingContext;
pub use transform::{Anchor, TransformModel};
pub use util::{CalibError, CalibResult};
