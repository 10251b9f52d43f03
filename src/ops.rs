// src/ops.rs
//
// Transform vocabulary and the resolved TransformSpec.
// These are cheap to create and copy - the expensive work happens in the engine.

use crate::error::{PixboxError, Result};
use image::ImageFormat;
use std::fmt;
use std::str::FromStr;

/// Default encoder quality when nothing else is configured.
pub const DEFAULT_QUALITY: u8 = 90;

/// Sizing mode: how source dimensions map onto the target box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Extract `rect` verbatim
    Region,
    /// Fit inside the box preserving aspect ratio; may enlarge
    Resize,
    /// Rotate by `degrees`, no scaling
    Rotate,
    /// Pass through unchanged
    Noop,
    /// Cover the box, trim overflow around the anchor
    Crop,
    /// Same geometry as crop
    Fill,
    /// Stretch to the exact box
    Scale,
    /// Fit inside the box preserving aspect ratio; never enlarges
    Clip,
}

impl Mode {
    pub const ALL: [Mode; 8] = [
        Mode::Region,
        Mode::Resize,
        Mode::Rotate,
        Mode::Noop,
        Mode::Crop,
        Mode::Fill,
        Mode::Scale,
        Mode::Clip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Region => "region",
            Mode::Resize => "resize",
            Mode::Rotate => "rotate",
            Mode::Noop => "noop",
            Mode::Crop => "crop",
            Mode::Fill => "fill",
            Mode::Scale => "scale",
            Mode::Clip => "clip",
        }
    }

    /// Whether this mode needs at least one of width/height.
    pub fn requires_target_box(&self) -> bool {
        !matches!(self, Mode::Region | Mode::Rotate | Mode::Noop)
    }
}

impl FromStr for Mode {
    type Err = PixboxError;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                PixboxError::invalid_option(
                    "mode",
                    s.to_string(),
                    "Expected one of region, resize, rotate, noop, crop, fill, scale, clip",
                )
            })
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resampling filter used for any resize step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Antialias,
    Bicubic,
    Bilinear,
    Nearest,
}

impl Filter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Filter::Antialias => "antialias",
            Filter::Bicubic => "bicubic",
            Filter::Bilinear => "bilinear",
            Filter::Nearest => "nearest",
        }
    }
}

impl FromStr for Filter {
    type Err = PixboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "antialias" => Ok(Filter::Antialias),
            "bicubic" => Ok(Filter::Bicubic),
            "bilinear" => Ok(Filter::Bilinear),
            "nearest" => Ok(Filter::Nearest),
            other => Err(PixboxError::invalid_option(
                "filter",
                other.to_string(),
                "Expected one of antialias, bicubic, bilinear, nearest",
            )),
        }
    }
}

/// Output encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Gif,
    Jpeg,
    Png,
    Webp,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Gif => "gif",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Gif => "image/gif",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
        }
    }

    /// Map a detected container onto the supported set.
    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Gif => Some(OutputFormat::Gif),
            ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
            ImageFormat::Png => Some(OutputFormat::Png),
            ImageFormat::WebP => Some(OutputFormat::Webp),
            _ => None,
        }
    }

    pub fn supports_alpha(&self) -> bool {
        !matches!(self, OutputFormat::Jpeg)
    }
}

impl FromStr for OutputFormat {
    type Err = PixboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gif" => Ok(OutputFormat::Gif),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::Webp),
            other => Err(PixboxError::invalid_option(
                "fmt",
                other.to_string(),
                "Expected one of gif, jpeg, jpg, png, webp",
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized point in `[0,1]x[0,1]` where the crop window is centered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Anchor {
    pub x: f64,
    pub y: f64,
}

impl Anchor {
    pub const CENTER: Anchor = Anchor { x: 0.5, y: 0.5 };

    pub fn new(x: f64, y: f64) -> Option<Self> {
        let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        (in_range(x) && in_range(y)).then_some(Anchor { x, y })
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        let (x, y) = match keyword {
            "center" | "centre" | "middle" => (0.5, 0.5),
            "top" | "north" | "n" => (0.5, 0.0),
            "bottom" | "south" | "s" => (0.5, 1.0),
            "left" | "west" | "w" => (0.0, 0.5),
            "right" | "east" | "e" => (1.0, 0.5),
            "top-left" | "left-top" | "northwest" | "nw" => (0.0, 0.0),
            "top-right" | "right-top" | "northeast" | "ne" => (1.0, 0.0),
            "bottom-left" | "left-bottom" | "southwest" | "sw" => (0.0, 1.0),
            "bottom-right" | "right-bottom" | "southeast" | "se" => (1.0, 1.0),
            _ => return None,
        };
        Some(Anchor { x, y })
    }
}

impl Default for Anchor {
    fn default() -> Self {
        Anchor::CENTER
    }
}

impl FromStr for Anchor {
    type Err = PixboxError;

    /// Accepts a compass keyword or an explicit `x,y` ratio pair.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            PixboxError::invalid_option(
                "pos",
                s.to_string(),
                "Expected a compass position (center, top, bottom-left, ...) or x,y ratios in [0,1]",
            )
        };

        if let Some(anchor) = Anchor::from_keyword(&s.to_ascii_lowercase()) {
            return Ok(anchor);
        }

        let (x, y) = s.split_once(',').ok_or_else(invalid)?;
        let x: f64 = x.trim().parse().map_err(|_| invalid())?;
        let y: f64 = y.trim().parse().map_err(|_| invalid())?;
        Anchor::new(x, y).ok_or_else(invalid)
    }
}

/// RGBA background color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Background(pub [u8; 4]);

impl Background {
    pub const WHITE: Background = Background([255, 255, 255, 255]);

    pub fn rgba(&self) -> [u8; 4] {
        self.0
    }
}

impl Default for Background {
    fn default() -> Self {
        Background::WHITE
    }
}

impl FromStr for Background {
    type Err = PixboxError;

    /// Hex color: `rgb`, `rgba`, `rrggbb` or `rrggbbaa`, optional leading `#`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            PixboxError::invalid_option(
                "bg",
                s.to_string(),
                "Expected a hex color with 3, 4, 6 or 8 digits",
            )
        };
        let hex = s.strip_prefix('#').unwrap_or(s);
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let nibble = |c: u8| -> u8 {
            match c {
                b'0'..=b'9' => c - b'0',
                b'a'..=b'f' => c - b'a' + 10,
                _ => c - b'A' + 10,
            }
        };
        let bytes = hex.as_bytes();
        let channels: Vec<u8> = match bytes.len() {
            3 | 4 => bytes.iter().map(|&c| nibble(c) * 17).collect(),
            6 | 8 => bytes
                .chunks(2)
                .map(|pair| nibble(pair[0]) * 16 + nibble(pair[1]))
                .collect(),
            _ => return Err(invalid()),
        };

        let alpha = channels.get(3).copied().unwrap_or(255);
        Ok(Background([channels[0], channels[1], channels[2], alpha]))
    }
}

/// Pixel rectangle in source space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    /// Center of the rectangle in source pixels.
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }
}

impl FromStr for Rect {
    type Err = PixboxError;

    /// `x,y,w,h` in source pixels.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            PixboxError::invalid_option(
                "rect",
                s.to_string(),
                "Expected x,y,w,h as non-negative integers",
            )
        };
        let parts: Vec<u32> = s
            .split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| invalid())?;
        match parts.as_slice() {
            [x, y, w, h] => Ok(Rect::new(*x, *y, *w, *h)),
            _ => Err(invalid()),
        }
    }
}

/// Fully resolved, immutable transform request.
///
/// Built by `options::resolve` from caller parameters merged onto defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformSpec {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mode: Mode,
    pub filter: Filter,
    /// None keeps the source format
    pub format: Option<OutputFormat>,
    /// 1..=100
    pub quality: u8,
    pub optimize: bool,
    pub background: Background,
    pub expand: bool,
    pub position: Option<Anchor>,
    /// Rotation in degrees, normalized to 0..360
    pub degrees: u32,
    /// Source rectangle for region mode
    pub rect: Option<Rect>,
}

impl Default for TransformSpec {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            mode: Mode::Crop,
            filter: Filter::Antialias,
            format: None,
            quality: DEFAULT_QUALITY,
            optimize: false,
            background: Background::WHITE,
            expand: false,
            position: None,
            degrees: 0,
            rect: None,
        }
    }
}

impl TransformSpec {
    /// Anchor used for crop/fill, defaulting to center.
    pub fn anchor(&self) -> Anchor {
        self.position.unwrap_or_default()
    }

    /// Output format, falling back to the source format.
    pub fn output_format(&self, source: OutputFormat) -> OutputFormat {
        self.format.unwrap_or(source)
    }
}
