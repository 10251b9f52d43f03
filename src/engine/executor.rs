// src/engine/executor.rs
//
// One request's CPU work: sniff -> decode -> geometry -> transform -> encode.
// Runs synchronously; callers put it on the rayon pool via `run_blocking`.

use crate::engine::decoder::{check_dimensions, decode_image, probe, sniff};
use crate::engine::encoder::encode;
use crate::engine::geometry::{compute_geometry, Geometry};
use crate::engine::pipeline::{crop, resize, rotate};
use crate::error::Result;
use crate::ops::{Mode, OutputFormat, TransformSpec};
use bytes::Bytes;
use image::{DynamicImage, GenericImageView};
use std::time::Instant;
use tracing::debug;

/// Encoded source bytes with their sniffed format.
#[derive(Clone, Debug)]
pub struct ImageHandle {
    bytes: Bytes,
    format: OutputFormat,
}

impl ImageHandle {
    /// Fails with `ImageFormat` unless the bytes are gif, jpeg, png or webp.
    pub fn new(bytes: Bytes) -> Result<Self> {
        let format = sniff(&bytes)?;
        Ok(Self { bytes, format })
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Header dimensions without decoding.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        probe(&self.bytes)
    }

    pub fn decode(&self) -> Result<DynamicImage> {
        decode_image(&self.bytes).map(|(img, _)| img)
    }
}

/// Encoded result of a transform.
#[derive(Clone, Debug)]
pub struct TransformOutput {
    pub bytes: Bytes,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

/// Run `spec` against `source`.
///
/// `noop` with the source format (or no explicit format) returns the source
/// bytes untouched, once the header dimensions pass the decode limits.
pub fn execute(source: Bytes, spec: &TransformSpec) -> Result<TransformOutput> {
    let started = Instant::now();
    let handle = ImageHandle::new(source)?;
    let format = spec.output_format(handle.format());

    if spec.mode == Mode::Noop && format == handle.format() {
        if let Some((width, height)) = handle.dimensions() {
            check_dimensions(width, height)?;
            debug!(%format, width, height, "noop pass-through");
            return Ok(TransformOutput {
                bytes: handle.bytes,
                format,
                width,
                height,
            });
        }
    }

    let img = handle.decode()?;
    let (source_w, source_h) = img.dimensions();
    let geometry = compute_geometry(source_w, source_h, spec)?;
    let img = transform(img, &geometry, spec)?;
    let (width, height) = img.dimensions();
    let encoded = encode(&img, format, spec.quality, spec.optimize, spec.background)?;

    debug!(
        mode = %spec.mode,
        source = %handle.format(),
        %format,
        source_w,
        source_h,
        width,
        height,
        bytes = encoded.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "transform complete"
    );

    Ok(TransformOutput {
        bytes: Bytes::from(encoded),
        format,
        width,
        height,
    })
}

/// Apply crop, resize and rotate in that order.
pub fn transform(img: DynamicImage, geometry: &Geometry, spec: &TransformSpec) -> Result<DynamicImage> {
    let mut img = match geometry.crop {
        Some(rect) => crop(&img, rect)?,
        None => img,
    };
    if let Some((w, h)) = geometry.resize {
        img = resize(img, w, h, spec.filter)?;
    }
    if let Some(degrees) = geometry.rotate {
        img = rotate(img, degrees, geometry.width, geometry.height, spec.background);
    }
    Ok(img)
}
