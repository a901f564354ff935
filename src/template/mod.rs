//! Tip templates and the per-session template series.

use std::time::Duration;

use crate::device::{Rig, Z_AXIS};
use crate::image::{ImageView, OwnedImage};
use crate::trace::{trace_event, trace_span};
use crate::util::{CalibError, CalibResult};

mod plan;

pub use plan::TemplatePlan;

/// Owned template image of the tip, tagged with the stage height offset it
/// was captured at relative to best focus.
#[derive(Clone, Debug)]
pub struct Template {
    img: OwnedImage,
    height_offset: f64,
}

impl Template {
    /// Creates an in-focus template from a contiguous grayscale buffer.
    pub fn new(data: Vec<u8>, width: usize, height: usize) -> CalibResult<Self> {
        let img = OwnedImage::new(data, width, height)?;
        Ok(Self::from_image(img, 0.0))
    }

    /// Wraps an owned image captured at `height_offset` from best focus.
    pub fn from_image(img: OwnedImage, height_offset: f64) -> Self {
        Self { img, height_offset }
    }

    /// Returns a borrowed view of the template data.
    pub fn view(&self) -> ImageView<'_, u8> {
        self.img.view()
    }

    /// Stage height offset from best focus at capture time.
    pub fn height_offset(&self) -> f64 {
        self.height_offset
    }
}

/// How the template series is sampled around best focus.
#[derive(Clone, Copy, Debug)]
pub struct TemplateConfig {
    /// Number of samples on each side of best focus.
    pub half_range: usize,
    /// Height spacing between samples.
    pub step: f64,
    /// Fraction of the frame (per dimension) cropped around the centre.
    pub zone_fraction: f64,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            half_range: 4,
            step: 1.0,
            zone_fraction: 0.25,
        }
    }
}

/// Ordered tip templates spanning a height range around best focus.
///
/// Captured once at the start of a calibration session and read-only after.
/// Matching always uses the in-focus template; the height offsets of the
/// others are relative to it.
#[derive(Clone, Debug)]
pub struct TemplateSeries {
    templates: Vec<Template>,
}

impl TemplateSeries {
    /// Builds a series from templates ordered by increasing height offset.
    ///
    /// The count must be odd so that a central (in-focus) template exists.
    pub fn new(templates: Vec<Template>) -> CalibResult<Self> {
        if templates.is_empty() || templates.len() % 2 == 0 {
            return Err(CalibError::InvalidInput(
                "template series needs an odd, non-zero count",
            ));
        }
        Ok(Self { templates })
    }

    /// Sweeps the stage height around its current position, cropping the
    /// central zone of each frame, then restores the height.
    pub fn capture(rig: &mut Rig<'_>, cfg: &TemplateConfig, settle: Duration) -> CalibResult<Self> {
        let _span = trace_span!("template_capture", samples = 2 * cfg.half_range + 1).entered();
        let z0 = rig.stage.position(Z_AXIS)?;
        let half = cfg.half_range as i64;
        let mut templates = Vec::with_capacity(2 * cfg.half_range + 1);
        for k in -half..=half {
            let offset = k as f64 * cfg.step;
            rig.stage.absolute_move(z0 + offset, Z_AXIS)?;
            rig.settle.settle(settle);
            let frame = rig.camera.frame()?;
            let (zone, _) = frame.view().central_zone(cfg.zone_fraction)?;
            templates.push(Template::from_image(OwnedImage::from_view(zone)?, offset));
        }
        rig.stage.absolute_move(z0, Z_AXIS)?;
        rig.settle.settle(settle);
        trace_event!("templates_captured", count = templates.len());
        Self::new(templates)
    }

    /// The template taken at best focus.
    pub fn central(&self) -> &Template {
        &self.templates[self.templates.len() / 2]
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Always false for a constructed series.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
