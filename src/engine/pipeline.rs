// src/engine/pipeline.rs
//
// Pixel operations applied after decoding: crop, resize, rotate, flatten.
// Resizing goes through fast_image_resize (SIMD); the image crate is the fallback.

use crate::engine::common::run_with_panic_policy;
use crate::error::{PixboxError, Result};
use crate::ops::{Background, Filter, Rect};
use fast_image_resize::{self as fir, ImageBufferError, MulDiv, PixelType, ResizeOptions};
use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage, RgbaImage};
use rayon::prelude::*;
use tracing::debug;

/// Extract `rect` from `img`. The rectangle must lie inside the image.
pub fn crop(img: &DynamicImage, rect: Rect) -> Result<DynamicImage> {
    let (w, h) = img.dimensions();
    if rect.width == 0 || rect.height == 0 || rect.right() > w as u64 || rect.bottom() > h as u64 {
        return Err(PixboxError::invalid_geometry(format!(
            "crop ({}+{}, {}+{}) exceeds image dimensions ({w}x{h})",
            rect.x, rect.width, rect.y, rect.height
        )));
    }
    Ok(img.crop_imm(rect.x, rect.y, rect.width, rect.height))
}

fn resize_options(filter: Filter) -> ResizeOptions {
    let alg = match filter {
        Filter::Antialias => fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3),
        Filter::Bicubic => fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom),
        Filter::Bilinear => fir::ResizeAlg::Convolution(fir::FilterType::Bilinear),
        Filter::Nearest => fir::ResizeAlg::Nearest,
    };
    ResizeOptions::new().resize_alg(alg)
}

fn fallback_filter(filter: Filter) -> FilterType {
    match filter {
        Filter::Antialias => FilterType::Lanczos3,
        Filter::Bicubic => FilterType::CatmullRom,
        Filter::Bilinear => FilterType::Triangle,
        Filter::Nearest => FilterType::Nearest,
    }
}

/// Resample to exactly `dst_width` x `dst_height`.
///
/// RGB8 and RGBA8 buffers are moved into the resizer without copying; other
/// layouts are converted to RGBA8 first.
pub fn resize(
    img: DynamicImage,
    dst_width: u32,
    dst_height: u32,
    filter: Filter,
) -> Result<DynamicImage> {
    let (src_width, src_height) = img.dimensions();
    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return Err(PixboxError::invalid_geometry(format!(
            "cannot resize {src_width}x{src_height} to {dst_width}x{dst_height}"
        )));
    }
    if (src_width, src_height) == (dst_width, dst_height) {
        return Ok(img);
    }

    let (pixel_type, src_pixels): (PixelType, Vec<u8>) = match img {
        DynamicImage::ImageRgb8(rgb) => (PixelType::U8x3, rgb.into_raw()),
        DynamicImage::ImageRgba8(rgba) => (PixelType::U8x4, rgba.into_raw()),
        other => (PixelType::U8x4, other.to_rgba8().into_raw()),
    };

    run_with_panic_policy("resize", || {
        resize_pixels(
            src_width, src_height, src_pixels, pixel_type, dst_width, dst_height, filter,
        )
        .map_err(|reason| {
            PixboxError::internal(format!(
                "resize {src_width}x{src_height} -> {dst_width}x{dst_height} failed: {reason}"
            ))
        })
    })
}

fn resize_pixels(
    src_width: u32,
    src_height: u32,
    mut src_pixels: Vec<u8>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    filter: Filter,
) -> std::result::Result<DynamicImage, String> {
    let required_bytes = (src_width as usize)
        .checked_mul(src_height as usize)
        .and_then(|n| n.checked_mul(pixel_type.size()))
        .ok_or_else(|| "image buffer size overflow during resize".to_string())?;
    if src_pixels.len() < required_bytes {
        return Err(format!(
            "source buffer too small: expected {required_bytes} bytes, got {}",
            src_pixels.len()
        ));
    }

    let options = resize_options(filter);
    let primary = match fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_pixels.as_mut_slice(),
        pixel_type,
    ) {
        Ok(src_image) => resize_with_source_image(src_image, pixel_type, dst_width, dst_height, &options),
        Err(ImageBufferError::InvalidBufferAlignment) => {
            let mut aligned = fir::images::Image::new(src_width, src_height, pixel_type);
            aligned
                .buffer_mut()
                .copy_from_slice(&src_pixels[..required_bytes]);
            resize_with_source_image(aligned, pixel_type, dst_width, dst_height, &options)
        }
        Err(other) => Err(format!("fir source image error: {other:?}")),
    };

    match primary {
        Ok(img) => Ok(img),
        Err(err) => {
            debug!(%err, "fast_image_resize failed, falling back to image crate");
            resize_with_image_crate(
                &src_pixels,
                src_width,
                src_height,
                pixel_type,
                dst_width,
                dst_height,
                fallback_filter(filter),
            )
            .map_err(|fallback_err| format!("{err}; image crate fallback failed: {fallback_err}"))
        }
    }
}

fn resize_with_source_image(
    mut src_image: fir::images::Image<'_>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    options: &ResizeOptions,
) -> std::result::Result<DynamicImage, String> {
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);

    // Premultiply so transparent pixels do not bleed color into their neighbours
    let needs_premultiply = pixel_type == PixelType::U8x4
        && src_image.buffer().iter().skip(3).step_by(4).any(|&a| a != 255);

    let mul_div = MulDiv::default();
    if needs_premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, options)
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if needs_premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }

    let dst_pixels = dst_image.into_vec();
    match pixel_type {
        PixelType::U8x3 => RgbImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| "failed to create rgb image from resized data".to_string()),
        PixelType::U8x4 => RgbaImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| "failed to create rgba image from resized data".to_string()),
        _ => Err("unsupported pixel type after resize".to_string()),
    }
}

fn resize_with_image_crate(
    src_pixels: &[u8],
    src_width: u32,
    src_height: u32,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    filter: FilterType,
) -> std::result::Result<DynamicImage, String> {
    match pixel_type {
        PixelType::U8x3 => {
            let rgb = RgbImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgb image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgb8(image::imageops::resize(
                &rgb, dst_width, dst_height, filter,
            )))
        }
        PixelType::U8x4 => {
            let rgba = RgbaImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgba image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgba8(image::imageops::resize(
                &rgba, dst_width, dst_height, filter,
            )))
        }
        _ => Err("fallback resize supports only U8x3/U8x4 pixel types".to_string()),
    }
}

/// Rotate counter-clockwise by `degrees` onto a `width` x `height` canvas.
///
/// Right angles are lossless pixel moves. Any other angle is resampled
/// bilinearly about the center; canvas pixels not covered by the source are
/// filled with `background`.
pub fn rotate(
    img: DynamicImage,
    degrees: u32,
    width: u32,
    height: u32,
    background: Background,
) -> DynamicImage {
    match degrees % 360 {
        0 => img,
        90 => img.rotate270(),
        180 => img.rotate180(),
        270 => img.rotate90(),
        other => DynamicImage::ImageRgba8(rotate_arbitrary(
            &img.to_rgba8(),
            other,
            width,
            height,
            background,
        )),
    }
}

fn rotate_arbitrary(
    src: &RgbaImage,
    degrees: u32,
    width: u32,
    height: u32,
    background: Background,
) -> RgbaImage {
    let (sw, sh) = src.dimensions();
    let radians = (degrees as f64).to_radians();
    let (sin, cos) = radians.sin_cos();
    let (scx, scy) = (sw as f64 / 2.0, sh as f64 / 2.0);
    let (dcx, dcy) = (width as f64 / 2.0, height as f64 / 2.0);
    let fill = background.rgba();

    let mut out = vec![0u8; width as usize * height as usize * 4];
    out.par_chunks_mut(width as usize * 4)
        .enumerate()
        .for_each(|(y, row)| {
            let dy = y as f64 + 0.5 - dcy;
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let dx = x as f64 + 0.5 - dcx;
                // Inverse mapping: destination pixel back into source space
                let sx = dx * cos - dy * sin + scx - 0.5;
                let sy = dx * sin + dy * cos + scy - 0.5;
                px.copy_from_slice(&sample_bilinear(src, sx, sy).unwrap_or(fill));
            }
        });

    // Buffer length matches width * height * 4 by construction
    RgbaImage::from_raw(width, height, out).unwrap_or_else(|| RgbaImage::new(width, height))
}

fn sample_bilinear(src: &RgbaImage, x: f64, y: f64) -> Option<[u8; 4]> {
    let (w, h) = src.dimensions();
    if x < -0.5 || y < -0.5 || x > w as f64 - 0.5 || y > h as f64 - 0.5 {
        return None;
    }
    let x = x.clamp(0.0, (w - 1) as f64);
    let y = y.clamp(0.0, (h - 1) as f64);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f64, y - y0 as f64);

    let p00 = src.get_pixel(x0, y0).0;
    let p10 = src.get_pixel(x1, y0).0;
    let p01 = src.get_pixel(x0, y1).0;
    let p11 = src.get_pixel(x1, y1).0;

    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Some(out)
}

/// Composite onto an opaque `background`, dropping the alpha channel.
pub fn flatten(img: &DynamicImage, background: Background) -> DynamicImage {
    if !img.color().has_alpha() {
        return DynamicImage::ImageRgb8(img.to_rgb8());
    }
    let [br, bg, bb, _] = background.rgba();
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let blend = |c: u8, b: u8, a: u8| -> u8 {
        let a = a as u32;
        ((c as u32 * a + b as u32 * (255 - a) + 127) / 255) as u8
    };
    DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        image::Rgb([blend(r, br, a), blend(g, bg, a), blend(b, bb, a)])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba};

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    fn create_test_image_rgba(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 200])
        }))
    }

    #[test]
    fn test_crop_valid() {
        let img = create_test_image(100, 100);
        let out = crop(&img, Rect::new(10, 20, 30, 40)).unwrap();
        assert_eq!(out.dimensions(), (30, 40));
        assert_eq!(out.to_rgb8().get_pixel(0, 0).0, [10, 20, 128]);
    }

    #[test]
    fn test_crop_out_of_bounds() {
        let img = create_test_image(100, 100);
        assert!(crop(&img, Rect::new(90, 0, 20, 10)).is_err());
        assert!(crop(&img, Rect::new(0, 0, 0, 10)).is_err());
        assert!(crop(&img, Rect::new(0, 0, 100, 100)).is_ok());
    }

    #[test]
    fn test_resize_every_filter() {
        for filter in [
            Filter::Antialias,
            Filter::Bicubic,
            Filter::Bilinear,
            Filter::Nearest,
        ] {
            let out = resize(create_test_image(64, 48), 32, 24, filter).unwrap();
            assert_eq!(out.dimensions(), (32, 24), "{filter:?}");
        }
    }

    #[test]
    fn test_resize_keeps_layout() {
        let out = resize(create_test_image_rgba(40, 40), 10, 10, Filter::Antialias).unwrap();
        assert!(matches!(out, DynamicImage::ImageRgba8(_)));
        let out = resize(create_test_image(40, 40), 80, 80, Filter::Bilinear).unwrap();
        assert!(matches!(out, DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn test_resize_converts_other_layouts() {
        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(20, 20, image::Luma([9])));
        let out = resize(gray, 5, 5, Filter::Nearest).unwrap();
        assert_eq!(out.dimensions(), (5, 5));
        assert_eq!(out.to_rgba8().get_pixel(2, 2).0, [9, 9, 9, 255]);
    }

    #[test]
    fn test_resize_same_size_is_passthrough() {
        let img = create_test_image(7, 5);
        let out = resize(img.clone(), 7, 5, Filter::Antialias).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_resize_zero_target_fails() {
        assert!(resize(create_test_image(10, 10), 0, 5, Filter::Antialias).is_err());
    }

    #[test]
    fn test_rotate_right_angles_counter_clockwise() {
        // Red marker in the top-right corner
        let mut rgb = RgbImage::from_pixel(4, 2, Rgb([0, 0, 0]));
        rgb.put_pixel(3, 0, Rgb([255, 0, 0]));
        let img = DynamicImage::ImageRgb8(rgb);

        let out = rotate(img.clone(), 90, 2, 4, Background::WHITE).to_rgb8();
        assert_eq!(out.dimensions(), (2, 4));
        // Counter-clockwise: top-right moves to top-left
        assert_eq!(out.get_pixel(0, 0).0, [255, 0, 0]);

        let out = rotate(img.clone(), 270, 2, 4, Background::WHITE).to_rgb8();
        assert_eq!(out.get_pixel(1, 3).0, [255, 0, 0]);

        let out = rotate(img, 180, 4, 2, Background::WHITE).to_rgb8();
        assert_eq!(out.get_pixel(0, 1).0, [255, 0, 0]);
    }

    #[test]
    fn test_rotate_arbitrary_fills_corners_with_background() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(50, 50, Rgb([0, 0, 255])));
        let out = rotate(img, 45, 71, 71, Background([255, 0, 0, 255])).to_rgba8();
        assert_eq!(out.dimensions(), (71, 71));
        assert_eq!(out.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(out.get_pixel(35, 35).0, [0, 0, 255, 255]);
    }

    #[test]
    fn test_flatten_blends_alpha() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgba([0, 0, 0, 0])
            } else {
                Rgba([0, 0, 0, 255])
            }
        }));
        let out = flatten(&img, Background::WHITE).to_rgb8();
        assert_eq!(out.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(out.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_flatten_half_alpha() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 128])));
        let out = flatten(&img, Background::WHITE).to_rgb8();
        // 255 * 127 / 255 = 127
        assert_eq!(out.get_pixel(0, 0).0, [127, 127, 127]);
    }
}
