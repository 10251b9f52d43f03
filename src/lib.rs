// lib.rs
//
// pixbox: an on-demand image transformation proxy.
//
// A request names a source image (bucket path, base64 URL, or `url` query
// parameter) plus transform options. The proxy fetches the source, applies
// the transform on a CPU pool and streams the re-encoded result back.

// jemalloc is not supported on Windows/MSVC
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod ops;
pub mod options;
pub mod security;
pub mod server;
pub mod service;
pub mod telemetry;

pub use config::{Cli, ProxyConfig};
pub use error::{ErrorKind, PixboxError, Result};
pub use ops::{Anchor, Background, Filter, Mode, OutputFormat, Rect, TransformSpec};
pub use service::{ImageRequest, ImageService, ProcessedImage};
