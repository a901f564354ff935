//! Read-only calibration data shared by the tracking procedures.

use crate::device::SettleConfig;
use crate::focus::FocusSearcher;
use crate::platform::PlatformCalibration;
use crate::template::Template;
use crate::transform::Anchor;

/// What an axis calibration or a recalibration reads but never changes.
#[derive(Clone, Copy)]
pub struct TrackingContext<'a> {
    /// In-focus tip template.
    pub template: &'a Template,
    pub platform: &'a PlatformCalibration,
    pub anchor: &'a Anchor,
    pub focus: &'a FocusSearcher,
    pub settle: &'a SettleConfig,
}
