// src/engine/geometry.rs
//
// Sizing math for every transform mode. Pure functions, no pixels.
//
// Dimension arithmetic is done in u64 integers with round-half-away-from-zero
// so results are identical on every platform. Anchor offsets use f64::round,
// which is also half-away-from-zero and independent of the FPU rounding mode.

use crate::engine::{MAX_DIMENSION, MAX_PIXELS};
use crate::error::{PixboxError, Result};
use crate::ops::{Anchor, Mode, Rect, TransformSpec};

/// Resolved geometry for one request.
///
/// The executor applies the steps in order: `crop` (source space), then
/// `resize`, then `rotate`. `width`/`height` are the final output size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    /// Source-space rectangle cut before any resampling
    pub crop: Option<Rect>,
    /// Anchor used to place `crop` (crop/fill only)
    pub anchor: Option<Anchor>,
    /// Resample to this size after cropping
    pub resize: Option<(u32, u32)>,
    /// Rotation in degrees (counter-clockwise), 1..360
    pub rotate: Option<u32>,
}

impl Geometry {
    fn passthrough(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            crop: None,
            anchor: None,
            resize: None,
            rotate: None,
        }
    }

    /// True when applying this geometry leaves the pixels untouched.
    pub fn is_identity(&self) -> bool {
        self.crop.is_none() && self.resize.is_none() && self.rotate.is_none()
    }
}

/// `n / d` rounded half away from zero. `d` must be non-zero.
///
/// Defined over the whole `u64` range: the half-way test compares the
/// remainder against its complement instead of doubling `n`.
pub fn round_div(n: u64, d: u64) -> u64 {
    let (quotient, remainder) = (n / d, n % d);
    quotient + u64::from(remainder >= d - remainder)
}

/// Compute output geometry for a `source_w` x `source_h` image.
pub fn compute_geometry(source_w: u32, source_h: u32, spec: &TransformSpec) -> Result<Geometry> {
    if source_w == 0 || source_h == 0 {
        return Err(PixboxError::invalid_geometry(format!(
            "source image has zero size ({source_w}x{source_h})"
        )));
    }

    let geometry = match spec.mode {
        Mode::Noop => Geometry::passthrough(source_w, source_h),
        Mode::Rotate => rotate_geometry(source_w, source_h, spec.degrees, spec.expand),
        Mode::Region => region_geometry(source_w, source_h, spec.rect)?,
        Mode::Scale | Mode::Crop | Mode::Fill | Mode::Clip | Mode::Resize => {
            let (target_w, target_h) = target_box(source_w, source_h, spec.width, spec.height)
                .ok_or_else(|| PixboxError::missing_dimension(spec.mode.as_str()))?;
            if target_w == 0 || target_h == 0 {
                return Err(PixboxError::invalid_geometry(format!(
                    "computed target {target_w}x{target_h} has a zero dimension"
                )));
            }
            box_geometry(source_w, source_h, target_w, target_h, spec)
        }
    };

    validate_output(&geometry)?;
    Ok(geometry)
}

/// Fill in a missing target dimension from the source aspect ratio.
/// Returns None when neither dimension is given.
fn target_box(
    source_w: u32,
    source_h: u32,
    width: Option<u32>,
    height: Option<u32>,
) -> Option<(u32, u32)> {
    let (sw, sh) = (source_w as u64, source_h as u64);
    match (width, height) {
        (Some(w), Some(h)) => Some((w, h)),
        (Some(w), None) => Some((w, saturate(round_div(w as u64 * sh, sw)))),
        (None, Some(h)) => Some((saturate(round_div(h as u64 * sw, sh)), h)),
        (None, None) => None,
    }
}

fn box_geometry(
    source_w: u32,
    source_h: u32,
    target_w: u32,
    target_h: u32,
    spec: &TransformSpec,
) -> Geometry {
    match spec.mode {
        Mode::Scale => with_resize(source_w, source_h, target_w, target_h, None),
        Mode::Crop | Mode::Fill => {
            let anchor = spec.anchor();
            let rect = cover_crop_rect(source_w, source_h, target_w, target_h, anchor);
            let crop = (rect != Rect::new(0, 0, source_w, source_h)).then_some(rect);
            let mut geometry = with_resize(rect.width, rect.height, target_w, target_h, crop);
            geometry.anchor = Some(anchor);
            geometry
        }
        Mode::Clip => {
            if source_w <= target_w && source_h <= target_h {
                Geometry::passthrough(source_w, source_h)
            } else {
                let (w, h) = fit_inside(source_w, source_h, target_w, target_h);
                with_resize(source_w, source_h, w, h, None)
            }
        }
        _ => {
            let (w, h) = fit_inside(source_w, source_h, target_w, target_h);
            with_resize(source_w, source_h, w, h, None)
        }
    }
}

fn with_resize(
    current_w: u32,
    current_h: u32,
    target_w: u32,
    target_h: u32,
    crop: Option<Rect>,
) -> Geometry {
    Geometry {
        width: target_w,
        height: target_h,
        crop,
        anchor: None,
        resize: ((current_w, current_h) != (target_w, target_h)).then_some((target_w, target_h)),
        rotate: None,
    }
}

/// Largest size with the source aspect ratio that fits inside the box.
fn fit_inside(source_w: u32, source_h: u32, target_w: u32, target_h: u32) -> (u32, u32) {
    let (sw, sh) = (source_w as u64, source_h as u64);
    let (tw, th) = (target_w as u64, target_h as u64);
    if sw * th > tw * sh {
        // Source is relatively wider, width is the binding edge
        (target_w, saturate(round_div(sh * tw, sw)))
    } else {
        (saturate(round_div(sw * th, sh)), target_h)
    }
}

/// Source-space window with the target aspect ratio, centered on the anchor
/// and clamped to the image.
fn cover_crop_rect(
    source_w: u32,
    source_h: u32,
    target_w: u32,
    target_h: u32,
    anchor: Anchor,
) -> Rect {
    let (sw, sh) = (source_w as u64, source_h as u64);
    let (tw, th) = (target_w as u64, target_h as u64);

    let (crop_w, crop_h) = if sw * th > tw * sh {
        // Trim left/right
        (round_div(sh * tw, th).clamp(1, sw), sh)
    } else {
        // Trim top/bottom
        (sw, round_div(sw * th, tw).clamp(1, sh))
    };

    let x = anchor_offset(anchor.x, sw, crop_w);
    let y = anchor_offset(anchor.y, sh, crop_h);
    Rect::new(x, y, crop_w as u32, crop_h as u32)
}

fn anchor_offset(ratio: f64, extent: u64, window: u64) -> u32 {
    let max = extent - window;
    let ideal = (ratio * extent as f64 - window as f64 / 2.0).round();
    if ideal <= 0.0 {
        0
    } else {
        (ideal as u64).min(max) as u32
    }
}

fn rotate_geometry(source_w: u32, source_h: u32, degrees: u32, expand: bool) -> Geometry {
    let degrees = degrees % 360;
    let (width, height) = match degrees {
        0 | 180 => (source_w, source_h),
        90 | 270 => (source_h, source_w),
        _ if expand => rotated_bounds(source_w, source_h, degrees),
        _ => (source_w, source_h),
    };
    Geometry {
        width,
        height,
        crop: None,
        anchor: None,
        resize: None,
        rotate: (degrees != 0).then_some(degrees),
    }
}

/// Bounding box of a `w` x `h` rectangle rotated by `degrees`.
pub(crate) fn rotated_bounds(w: u32, h: u32, degrees: u32) -> (u32, u32) {
    let radians = (degrees as f64).to_radians();
    let (sin, cos) = (radians.sin().abs(), radians.cos().abs());
    let (w, h) = (w as f64, h as f64);
    let bw = (w * cos + h * sin).round().max(1.0);
    let bh = (w * sin + h * cos).round().max(1.0);
    (bw as u32, bh as u32)
}

fn region_geometry(source_w: u32, source_h: u32, rect: Option<Rect>) -> Result<Geometry> {
    let rect = rect.ok_or_else(|| {
        PixboxError::invalid_option("rect", "", "Region mode requires rect=x,y,w,h")
    })?;
    if rect.width == 0 || rect.height == 0 {
        return Err(PixboxError::invalid_geometry(format!(
            "region {}x{} has a zero dimension",
            rect.width, rect.height
        )));
    }
    if rect.right() > source_w as u64 || rect.bottom() > source_h as u64 {
        return Err(PixboxError::invalid_geometry(format!(
            "region ({}+{}, {}+{}) exceeds image dimensions ({source_w}x{source_h})",
            rect.x, rect.width, rect.y, rect.height
        )));
    }
    let crop = (rect != Rect::new(0, 0, source_w, source_h)).then_some(rect);
    Ok(Geometry {
        width: rect.width,
        height: rect.height,
        crop,
        anchor: None,
        resize: None,
        rotate: None,
    })
}

fn validate_output(geometry: &Geometry) -> Result<()> {
    let (w, h) = (geometry.width, geometry.height);
    if w == 0 || h == 0 {
        return Err(PixboxError::invalid_geometry(format!(
            "computed output {w}x{h} has a zero dimension"
        )));
    }
    if w > MAX_DIMENSION || h > MAX_DIMENSION {
        return Err(PixboxError::invalid_geometry(format!(
            "computed output {w}x{h} exceeds maximum dimension {MAX_DIMENSION}"
        )));
    }
    if w as u64 * h as u64 > MAX_PIXELS {
        return Err(PixboxError::invalid_geometry(format!(
            "computed output {w}x{h} exceeds maximum pixel count {MAX_PIXELS}"
        )));
    }
    Ok(())
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
