//! Camera frames and image views.
//!
//! `ImageView` is a borrowed 2D view into a 1D buffer with an explicit stride.
//! The stride counts elements between the starts of consecutive rows, so a
//! stride larger than the width represents padded rows. ROI slices are zero-copy
//! views into the same backing slice and retain the original stride.
//!
//! `OwnedImage` is what a camera hands back each control-loop tick.

use crate::util::{CalibError, CalibResult};

#[cfg(feature = "image-io")]
pub mod io;

/// Borrowed 2D image view with an explicit stride.
#[derive(Copy, Clone)]
pub struct ImageView<'a, T> {
    data: &'a [T],
    width: usize,
    height: usize,
    stride: usize,
}

impl<'a, T> ImageView<'a, T> {
    /// Creates a contiguous view with `stride == width`.
    pub fn from_slice(data: &'a [T], width: usize, height: usize) -> CalibResult<Self> {
        Self::new(data, width, height, width)
    }

    /// Creates a view with an explicit stride.
    pub fn new(data: &'a [T], width: usize, height: usize, stride: usize) -> CalibResult<Self> {
        let needed = required_len(width, height, stride)?;
        if data.len() < needed {
            return Err(CalibError::BufferTooSmall {
                needed,
                got: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            stride,
        })
    }

    /// Returns the image width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Returns the image height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Returns the stride in elements between row starts.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Returns the backing slice including any row padding.
    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }

    /// Returns the element at `(x, y)` if it is within bounds.
    pub fn get(&self, x: usize, y: usize) -> Option<&'a T> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = y.checked_mul(self.stride)?.checked_add(x)?;
        self.data.get(idx)
    }

    /// Returns a contiguous slice for row `y` with length `width`.
    pub fn row(&self, y: usize) -> Option<&'a [T]> {
        if y >= self.height {
            return None;
        }
        let start = y.checked_mul(self.stride)?;
        let end = start.checked_add(self.width)?;
        self.data.get(start..end)
    }

    /// Returns a zero-copy ROI view into the same backing buffer.
    pub fn roi(&self, x: usize, y: usize, width: usize, height: usize) -> CalibResult<ImageView<'a, T>> {
        if width == 0 || height == 0 {
            return Err(CalibError::InvalidDimensions { width, height });
        }

        let out_of_bounds = CalibError::RoiOutOfBounds {
            x,
            y,
            width,
            height,
            img_width: self.width,
            img_height: self.height,
        };
        let end_x = x.checked_add(width).ok_or_else(|| out_of_bounds.clone())?;
        let end_y = y.checked_add(height).ok_or_else(|| out_of_bounds.clone())?;
        if end_x > self.width || end_y > self.height {
            return Err(out_of_bounds);
        }

        let start = y
            .checked_mul(self.stride)
            .and_then(|v| v.checked_add(x))
            .ok_or(CalibError::InvalidDimensions {
                width: self.width,
                height: self.height,
            })?;
        let data = self.data.get(start..).ok_or(CalibError::BufferTooSmall {
            needed: start.saturating_add(1),
            got: self.data.len(),
        })?;

        ImageView::new(data, width, height, self.stride)
    }

    /// Returns the centred ROI covering `fraction` of each dimension together
    /// with its top-left corner in this view.
    ///
    /// The zone is at least one pixel wide and never larger than the view.
    pub fn central_zone(&self, fraction: f64) -> CalibResult<(ImageView<'a, T>, (usize, usize))> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(CalibError::InvalidInput("zone fraction must be in (0, 1]"));
        }
        let zone_w = (self.width as f64 * fraction).round() as usize;
        let zone_h = (self.height as f64 * fraction).round() as usize;
        self.centred_window(zone_w, zone_h)
    }

    /// Returns a `width` x `height` ROI centred in this view, clamped to the
    /// view, together with its top-left corner.
    pub fn centred_window(
        &self,
        width: usize,
        height: usize,
    ) -> CalibResult<(ImageView<'a, T>, (usize, usize))> {
        let zone_w = width.clamp(1, self.width);
        let zone_h = height.clamp(1, self.height);
        let x0 = (self.width - zone_w) / 2;
        let y0 = (self.height - zone_h) / 2;
        Ok((self.roi(x0, y0, zone_w, zone_h)?, (x0, y0)))
    }
}

fn required_len(width: usize, height: usize, stride: usize) -> CalibResult<usize> {
    if width == 0 || height == 0 {
        return Err(CalibError::InvalidDimensions { width, height });
    }
    if stride < width {
        return Err(CalibError::InvalidStride { width, stride });
    }
    let needed = (height - 1)
        .checked_mul(stride)
        .and_then(|v| v.checked_add(width))
        .ok_or(CalibError::InvalidDimensions { width, height })?;
    Ok(needed)
}

/// Owned contiguous grayscale image buffer.
#[derive(Clone, Debug)]
pub struct OwnedImage {
    data: Vec<u8>,
    width: usize,
    height: usize,
}

impl OwnedImage {
    /// Wraps a contiguous buffer of exactly `width * height` pixels.
    pub fn new(data: Vec<u8>, width: usize, height: usize) -> CalibResult<Self> {
        if width == 0 || height == 0 {
            return Err(CalibError::InvalidDimensions { width, height });
        }
        let needed = width
            .checked_mul(height)
            .ok_or(CalibError::InvalidDimensions { width, height })?;
        if data.len() < needed {
            return Err(CalibError::BufferTooSmall {
                needed,
                got: data.len(),
            });
        }
        if data.len() > needed {
            return Err(CalibError::InvalidDimensions { width, height });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Copies a (possibly strided) view into a contiguous buffer.
    pub fn from_view(view: ImageView<'_, u8>) -> CalibResult<Self> {
        let width = view.width();
        let height = view.height();
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            let row = view.row(y).ok_or(CalibError::BufferTooSmall {
                needed: (y + 1) * view.stride(),
                got: view.as_slice().len(),
            })?;
            data.extend_from_slice(row);
        }
        Self::new(data, width, height)
    }

    /// Returns the image width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Returns the image height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Returns the raw pixel buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns a borrowed view of the image.
    pub fn view(&self) -> ImageView<'_, u8> {
        ImageView {
            data: &self.data,
            width: self.width,
            height: self.height,
            stride: self.width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ImageView, OwnedImage};

    #[test]
    fn central_zone_is_centred() {
        let data: Vec<u8> = (0u8..64).collect();
        let view = ImageView::from_slice(&data, 8, 8).unwrap();
        let (zone, origin) = view.central_zone(0.5).unwrap();
        assert_eq!(origin, (2, 2));
        assert_eq!((zone.width(), zone.height()), (4, 4));
        assert_eq!(zone.get(0, 0).copied(), Some(18));
    }

    #[test]
    fn central_zone_keeps_at_least_one_pixel() {
        let data = [7u8; 4];
        let view = ImageView::from_slice(&data, 2, 2).unwrap();
        let (zone, origin) = view.central_zone(0.1).unwrap();
        assert_eq!((zone.width(), zone.height()), (1, 1));
        assert_eq!(origin, (0, 0));
        assert!(view.central_zone(0.0).is_err());
    }

    #[test]
    fn owned_from_strided_view_drops_padding() {
        let data: Vec<u8> = (0u8..12).collect();
        let view = ImageView::new(&data, 3, 3, 4).unwrap();
        let owned = OwnedImage::from_view(view).unwrap();
        assert_eq!(owned.data(), &[0, 1, 2, 4, 5, 6, 8, 9, 10]);
    }
}
