// src/engine/encoder.rs
//
// Encoder operations: JPEG (mozjpeg), PNG (image + oxipng), WebP (libwebp), GIF (image crate).
//
// `optimize` trades CPU for bytes: progressive JPEG with optimized scans,
// oxipng recompression, and a slower WebP method.

use crate::engine::common::run_with_panic_policy;
use crate::engine::pipeline::flatten;
use crate::engine::MAX_DIMENSION;
use crate::error::{PixboxError, Result};
use crate::ops::{Background, OutputFormat};
use image::{DynamicImage, ImageFormat};
use mozjpeg::{ColorSpace, Compress, ScanMode};
use std::borrow::Cow;
use std::io::Cursor;

/// Derives per-format encoder knobs from a 1..=100 quality value.
///
/// Bands:
/// - High (>=85): visual quality first
/// - Balanced (70-84)
/// - Fast (<70): speed first
#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    quality: f32,
    optimize: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QualityBand {
    High,
    Balanced,
    Fast,
}

impl QualitySettings {
    pub fn new(quality: u8, optimize: bool) -> Self {
        Self {
            quality: quality.clamp(1, 100) as f32,
            optimize,
        }
    }

    pub fn quality(&self) -> f32 {
        self.quality
    }

    fn band(&self) -> QualityBand {
        if self.quality >= 85.0 {
            QualityBand::High
        } else if self.quality >= 70.0 {
            QualityBand::Balanced
        } else {
            QualityBand::Fast
        }
    }

    pub fn jpeg_smoothing(&self) -> u8 {
        match self.band() {
            QualityBand::High => 0,
            QualityBand::Balanced => 5,
            QualityBand::Fast => 10,
        }
    }

    pub fn webp_method(&self) -> i32 {
        if self.optimize {
            6
        } else {
            4
        }
    }

    pub fn webp_pass(&self) -> i32 {
        if self.optimize {
            3
        } else {
            1
        }
    }

    pub fn webp_sns_strength(&self) -> i32 {
        match self.band() {
            QualityBand::High => 50,
            QualityBand::Balanced => 70,
            QualityBand::Fast => 80,
        }
    }

    pub fn webp_filter_strength(&self) -> i32 {
        if self.quality >= 80.0 {
            20
        } else if self.quality >= 60.0 {
            30
        } else {
            40
        }
    }

    pub fn webp_filter_sharpness(&self) -> i32 {
        match self.band() {
            QualityBand::High => 2,
            QualityBand::Balanced | QualityBand::Fast => 0,
        }
    }

    /// oxipng preset, or None to skip recompression.
    pub fn png_preset(&self) -> Option<u8> {
        self.optimize.then_some(4)
    }
}

/// Encode `img` as `format`.
///
/// JPEG has no alpha channel, so transparent pixels are composited onto
/// `background` first. Other formats keep alpha as-is.
pub fn encode(
    img: &DynamicImage,
    format: OutputFormat,
    quality: u8,
    optimize: bool,
    background: Background,
) -> Result<Vec<u8>> {
    let settings = QualitySettings::new(quality, optimize);
    match format {
        OutputFormat::Jpeg => {
            let flat = if img.color().has_alpha() {
                Cow::Owned(flatten(img, background))
            } else {
                Cow::Borrowed(img)
            };
            encode_jpeg(&flat, &settings)
        }
        OutputFormat::Png => encode_png(img, &settings),
        OutputFormat::Webp => encode_webp(img, &settings),
        OutputFormat::Gif => encode_gif(img),
    }
}

/// Encode to JPEG using mozjpeg.
pub fn encode_jpeg(img: &DynamicImage, settings: &QualitySettings) -> Result<Vec<u8>> {
    run_with_panic_policy("encode:jpeg", || {
        let rgb: Cow<'_, image::RgbImage> = match img {
            DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
            _ => Cow::Owned(img.to_rgb8()),
        };
        let (w, h) = rgb.dimensions();
        let pixels: &[u8] = rgb.as_raw();

        // Reject what would make libjpeg abort
        if w == 0 || h == 0 {
            return Err(PixboxError::encode_failed(
                "jpeg",
                "width or height is zero",
            ));
        }
        if w > MAX_DIMENSION || h > MAX_DIMENSION {
            return Err(PixboxError::encode_failed(
                "jpeg",
                format!("{w}x{h} exceeds max dimension {MAX_DIMENSION}"),
            ));
        }

        let mut comp = Compress::new(ColorSpace::JCS_RGB);
        comp.set_size(w as usize, h as usize);
        comp.set_color_space(ColorSpace::JCS_YCbCr);
        comp.set_quality(settings.quality());
        comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
        comp.set_smoothing_factor(settings.jpeg_smoothing());
        comp.set_optimize_coding(true);

        if settings.optimize {
            comp.set_progressive_mode();
            comp.set_optimize_scans(true);
            comp.set_scan_optimization_mode(ScanMode::AllComponentsTogether);
        } else {
            comp.set_optimize_scans(false);
        }

        let estimated_size = (w as usize * h as usize * 3 / 10).max(4096);
        let mut output = Vec::with_capacity(estimated_size);
        {
            let mut writer = comp.start_compress(&mut output).map_err(|e| {
                PixboxError::encode_failed("jpeg", format!("mozjpeg: failed to start compress: {e:?}"))
            })?;

            let stride = w as usize * 3;
            for row in pixels.chunks(stride) {
                writer.write_scanlines(row).map_err(|e| {
                    PixboxError::encode_failed(
                        "jpeg",
                        format!("mozjpeg: failed to write scanlines: {e:?}"),
                    )
                })?;
            }

            writer.finish().map_err(|e| {
                PixboxError::encode_failed("jpeg", format!("mozjpeg: failed to finish: {e:?}"))
            })?;
        }
        Ok(output)
    })
}

/// Encode to PNG with the image crate, recompressing with oxipng when optimizing.
pub fn encode_png(img: &DynamicImage, settings: &QualitySettings) -> Result<Vec<u8>> {
    run_with_panic_policy("encode:png", || {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| PixboxError::encode_failed("png", format!("PNG encode failed: {e}")))?;

        let Some(preset) = settings.png_preset() else {
            return Ok(buf);
        };

        let mut options = oxipng::Options::from_preset(preset);
        options.strip = oxipng::StripChunks::Safe;
        oxipng::optimize_from_memory(&buf, &options).map_err(|e| {
            PixboxError::encode_failed("png", format!("oxipng optimization failed: {e}"))
        })
    })
}

/// Encode to lossy WebP. Alpha is kept only when the image carries it.
pub fn encode_webp(img: &DynamicImage, settings: &QualitySettings) -> Result<Vec<u8>> {
    run_with_panic_policy("encode:webp", || {
        let mut config = webp::WebPConfig::new()
            .map_err(|_| PixboxError::encode_failed("webp", "failed to create WebPConfig"))?;
        config.quality = settings.quality();
        config.method = settings.webp_method();
        config.pass = settings.webp_pass();
        config.preprocessing = 0;
        config.sns_strength = settings.webp_sns_strength();
        config.autofilter = 1;
        config.filter_strength = settings.webp_filter_strength();
        config.filter_sharpness = settings.webp_filter_sharpness();

        let encoded = if img.color().has_alpha() {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            webp::Encoder::from_rgba(&rgba, w, h).encode_advanced(&config)
        } else {
            let rgb: Cow<'_, image::RgbImage> = match img {
                DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
                _ => Cow::Owned(img.to_rgb8()),
            };
            let (w, h) = rgb.dimensions();
            webp::Encoder::from_rgb(&rgb, w, h).encode_advanced(&config)
        };
        let mem = encoded
            .map_err(|e| PixboxError::encode_failed("webp", format!("WebP encode failed: {e:?}")))?;

        Ok(mem.to_vec())
    })
}

/// Encode a single-frame GIF. The palette is quantized by the image crate.
pub fn encode_gif(img: &DynamicImage) -> Result<Vec<u8>> {
    run_with_panic_policy("encode:gif", || {
        let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
        let mut buf = Vec::new();
        rgba.write_to(&mut Cursor::new(&mut buf), ImageFormat::Gif)
            .map_err(|e| PixboxError::encode_failed("gif", format!("GIF encode failed: {e}")))?;
        Ok(buf)
    })
}
