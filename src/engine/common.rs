// src/engine/common.rs
//
// Panic containment for codec calls. Native decoders occasionally panic on
// hostile input; a panic must surface as an error response, never take down
// a worker thread.

use crate::error::{PixboxError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Run `f`, converting a panic into `PixboxError::Internal` tagged with `stage`.
pub fn run_with_panic_policy<T, F>(stage: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            error!(%stage, %detail, "codec panicked");
            Err(PixboxError::internal(format!("{stage} panicked: {detail}")))
        }
    }
}
