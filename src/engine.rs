// src/engine.rs
//
// The image side of pixbox:
// 1. geometry   - pure sizing/anchor math
// 2. decoder    - bytes -> pixels for gif/jpeg/png/webp
// 3. pipeline   - crop/resize/rotate on decoded pixels
// 4. encoder    - pixels -> bytes honoring quality/optimize
// 5. executor   - drives the above for one request
// 6. pool       - rayon pool so CPU work never blocks the async runtime

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Maximum allowed image dimension (width or height), for sources and targets.
/// Larger images are rejected to prevent decompression bombs.
pub const MAX_DIMENSION: u32 = 32768;

/// Maximum allowed total pixels (width * height).
/// 100 megapixels = 400MB uncompressed RGBA.
pub const MAX_PIXELS: u64 = 100_000_000;

mod common;
mod decoder;
mod encoder;
mod executor;
mod geometry;
mod pipeline;
mod pool;

pub use common::run_with_panic_policy;
pub use decoder::{check_dimensions, decode_image, detect_format, probe, sniff};
pub use encoder::{encode, encode_jpeg, encode_png, encode_webp, QualitySettings};
pub use executor::{execute, transform, ImageHandle, TransformOutput};
pub use geometry::{compute_geometry, round_div, Geometry};
pub use pipeline::{crop, flatten, resize, rotate};
pub use pool::{get_pool, run_blocking};
