// src/engine/decoder.rs
//
// Decoder operations: JPEG (mozjpeg), PNG (zune-png), WebP (libwebp), GIF (image crate).
// Every entry point runs under the panic policy and checks source dimensions
// before allocating pixel buffers.

use crate::engine::common::run_with_panic_policy;
use crate::engine::{MAX_DIMENSION, MAX_PIXELS};
use crate::error::{PixboxError, Result};
use crate::ops::OutputFormat;
use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, ImageReader, RgbImage, RgbaImage,
};
use mozjpeg::Decompress;
use std::io::Cursor;
use webp::{BitstreamFeatures, Decoder as WebPDecoder};
use zune_core::colorspace::ColorSpace;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

/// Decode JPEG using mozjpeg (backed by libjpeg-turbo)
pub fn decode_jpeg_mozjpeg(data: &[u8]) -> Result<DynamicImage> {
    run_with_panic_policy("decode:mozjpeg", || {
        if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
            return Err(PixboxError::decode_failed(
                "mozjpeg: missing JPEG EOI marker",
            ));
        }

        let decompress = Decompress::new_mem(data).map_err(|e| {
            PixboxError::decode_failed(format!("mozjpeg decompress init failed: {e:?}"))
        })?;

        let mut decompress = decompress.rgb().map_err(|e| {
            PixboxError::decode_failed(format!("mozjpeg rgb conversion failed: {e:?}"))
        })?;

        let (width, height) = (decompress.width(), decompress.height());
        if width > MAX_DIMENSION as usize || height > MAX_DIMENSION as usize {
            return Err(PixboxError::decode_failed(format!(
                "image dimensions {width}x{height} exceed max {MAX_DIMENSION}"
            )));
        }
        let (width, height) = (width as u32, height as u32);
        check_dimensions(width, height)?;

        let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
            PixboxError::decode_failed(format!("mozjpeg: failed to read scanlines: {e:?}"))
        })?;
        let flat: Vec<u8> = pixels.into_iter().flatten().collect();

        RgbImage::from_raw(width, height, flat)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| PixboxError::decode_failed("mozjpeg: failed to create image from raw data"))
    })
}

/// Decode PNG using zune-png. 16-bit input is stripped to 8-bit.
pub fn decode_png_zune(data: &[u8]) -> Result<DynamicImage> {
    run_with_panic_policy("decode:png", || {
        let options = DecoderOptions::default().png_set_strip_to_8bit(true);
        let mut decoder = PngDecoder::new_with_options(Cursor::new(data), options);
        decoder
            .decode_headers()
            .map_err(|e| PixboxError::decode_failed(format!("png: bad header: {e}")))?;

        let info = decoder
            .info()
            .ok_or_else(|| PixboxError::decode_failed("png: missing header info"))?;
        let (width, height) = (info.width as u32, info.height as u32);
        check_dimensions(width, height)?;

        let pixels = decoder
            .decode()
            .map_err(|e| PixboxError::decode_failed(format!("png: decode failed: {e}")))?;
        let buf = match pixels {
            zune_core::result::DecodingResult::U8(v) => v,
            _ => {
                return Err(PixboxError::decode_failed(
                    "png: unexpected non-U8 pixel buffer",
                ))
            }
        };

        let colorspace = decoder
            .colorspace()
            .ok_or_else(|| PixboxError::decode_failed("png: missing colorspace"))?;

        match colorspace {
            ColorSpace::RGB => RgbImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| PixboxError::decode_failed("png: failed to build RGB image")),
            ColorSpace::RGBA => RgbaImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(|| PixboxError::decode_failed("png: failed to build RGBA image")),
            ColorSpace::Luma => GrayImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| PixboxError::decode_failed("png: failed to build Luma image")),
            ColorSpace::LumaA => GrayAlphaImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLumaA8)
                .ok_or_else(|| PixboxError::decode_failed("png: failed to build LumaA image")),
            other => Err(PixboxError::decode_failed(format!(
                "png: unsupported colorspace {other:?}"
            ))),
        }
    })
}

/// Decode WebP using libwebp. Animated WebP falls back to the image crate (first frame).
pub fn decode_webp_libwebp(data: &[u8]) -> Result<DynamicImage> {
    run_with_panic_policy("decode:webp", || {
        // Header first, so malformed files never allocate
        let features = BitstreamFeatures::new(data)
            .ok_or_else(|| PixboxError::decode_failed("webp: failed to read bitstream features"))?;
        check_dimensions(features.width(), features.height())?;

        if features.has_animation() {
            return image::load_from_memory_with_format(data, ImageFormat::WebP).map_err(|e| {
                PixboxError::decode_failed(format!("webp (animated) decode failed: {e}"))
            });
        }

        let decoded = WebPDecoder::new(data)
            .decode()
            .ok_or_else(|| PixboxError::decode_failed("webp: decode failed"))?;
        check_dimensions(decoded.width(), decoded.height())?;

        Ok(decoded.to_image())
    })
}

/// Decode GIF through the image crate. Only the first frame is kept.
pub fn decode_gif(data: &[u8]) -> Result<DynamicImage> {
    run_with_panic_policy("decode:gif", || {
        if let Some((width, height)) = probe(data) {
            check_dimensions(width, height)?;
        }
        image::load_from_memory_with_format(data, ImageFormat::Gif)
            .map_err(|e| PixboxError::decode_failed(format!("gif: decode failed: {e}")))
    })
}

/// Detect input format using magic bytes. Returns None if unknown.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

/// Detect the format and map it onto the supported set.
/// Anything outside gif/jpeg/png/webp is `ImageFormat`.
pub fn sniff(bytes: &[u8]) -> Result<OutputFormat> {
    match detect_format(bytes) {
        Some(format) => OutputFormat::from_image_format(format).ok_or_else(|| {
            PixboxError::image_format(
                format
                    .extensions_str()
                    .first()
                    .copied()
                    .unwrap_or("unknown"),
            )
        }),
        None => Err(PixboxError::image_format("unknown")),
    }
}

/// Header-only dimensions, without decoding pixels.
pub fn probe(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Unified decode entrypoint: detect once, route to the fastest decoder.
pub fn decode_image(bytes: &[u8]) -> Result<(DynamicImage, OutputFormat)> {
    let format = sniff(bytes)?;
    let img = match format {
        OutputFormat::Jpeg => decode_jpeg_mozjpeg(bytes)?,
        OutputFormat::Png => decode_png_zune(bytes)?,
        OutputFormat::Webp => decode_webp_libwebp(bytes)?,
        OutputFormat::Gif => decode_gif(bytes)?,
    };
    Ok((img, format))
}

/// Reject sources larger than the decoder limits (decompression bombs).
pub fn check_dimensions(width: u32, height: u32) -> Result<()> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(PixboxError::decode_failed(format!(
            "image dimensions {width}x{height} exceed max {MAX_DIMENSION}"
        )));
    }
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(PixboxError::decode_failed(format!(
            "image has {pixels} pixels, max is {MAX_PIXELS}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{GenericImageView, Rgb, RgbImage};

    fn encode_webp(width: u32, height: u32) -> Vec<u8> {
        let rgb: Vec<u8> = std::iter::repeat([10u8, 20u8, 30u8])
            .take((width * height) as usize)
            .flatten()
            .collect();
        webp::Encoder::from_rgb(&rgb, width, height)
            .encode_lossless()
            .to_vec()
    }

    fn encode_with(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 7]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buffer), format)
            .unwrap();
        buffer
    }

    #[test]
    fn test_sniff_supported_formats() {
        assert_eq!(sniff(&encode_with(2, 2, ImageFormat::Png)).unwrap(), OutputFormat::Png);
        assert_eq!(sniff(&encode_with(2, 2, ImageFormat::Jpeg)).unwrap(), OutputFormat::Jpeg);
        assert_eq!(sniff(&encode_with(2, 2, ImageFormat::Gif)).unwrap(), OutputFormat::Gif);
        assert_eq!(sniff(&encode_webp(2, 2)).unwrap(), OutputFormat::Webp);
    }

    #[test]
    fn test_sniff_rejects_unsupported_and_garbage() {
        let bmp = b"BM\x3a\x00\x00\x00\x00\x00\x00\x00\x36\x00\x00\x00";
        let err = sniff(bmp).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageFormat);
        assert!(err.to_string().contains("bmp"));
        assert_eq!(sniff(b"not an image").unwrap_err().kind(), ErrorKind::ImageFormat);
    }

    #[test]
    fn test_probe_reads_header_dimensions() {
        assert_eq!(probe(&encode_with(13, 7, ImageFormat::Png)), Some((13, 7)));
        assert_eq!(probe(b"garbage"), None);
    }

    #[test]
    fn test_decode_image_routes_png_to_zune() {
        let (img, fmt) = decode_image(&encode_with(3, 1, ImageFormat::Png)).unwrap();
        assert_eq!(fmt, OutputFormat::Png);
        assert_eq!(img.to_rgb8().get_pixel(2, 0).0, [2, 0, 7]);
    }

    #[test]
    fn test_decode_image_routes_jpeg_to_mozjpeg() {
        let (img, fmt) = decode_image(&encode_with(4, 2, ImageFormat::Jpeg)).unwrap();
        assert_eq!(fmt, OutputFormat::Jpeg);
        assert_eq!(img.dimensions(), (4, 2));
    }

    #[test]
    fn test_decode_image_routes_webp_to_libwebp() {
        let (img, fmt) = decode_image(&encode_webp(3, 2)).unwrap();
        assert_eq!(fmt, OutputFormat::Webp);
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.to_rgb8().get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn test_decode_gif_first_frame() {
        let (img, fmt) = decode_image(&encode_with(5, 4, ImageFormat::Gif)).unwrap();
        assert_eq!(fmt, OutputFormat::Gif);
        assert_eq!(img.dimensions(), (5, 4));
    }

    #[test]
    fn test_truncated_jpeg_is_decode_error() {
        let jpeg = encode_with(8, 8, ImageFormat::Jpeg);
        let err = decode_image(&jpeg[..jpeg.len() / 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageFormat);
    }

    #[test]
    fn test_check_dimensions_limits() {
        assert!(check_dimensions(MAX_DIMENSION, 1).is_ok());
        assert!(check_dimensions(MAX_DIMENSION + 1, 1).is_err());
        assert!(check_dimensions(20_000, 20_000).is_err());
    }

    #[test]
    fn test_oversized_png_rejected_before_decode() {
        let data = encode_with(MAX_DIMENSION + 1, 1, ImageFormat::Png);
        let err = decode_image(&data).unwrap_err();
        assert!(matches!(err, PixboxError::Decode { .. }));
    }
}
