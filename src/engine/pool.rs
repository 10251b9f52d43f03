// src/engine/pool.rs
//
// Global rayon pool for decode/transform/encode.
//
// A single pool is shared by all requests so async workers never block on
// CPU work. It is sized from available_parallelism (which respects cgroup CPU
// quotas) and built lazily on first use.
//
// Cancellation: if the awaiting request is dropped before a queued job starts,
// the job is skipped. A job that already started runs to completion and its
// result is discarded.

use crate::error::{PixboxError, Result};
use rayon::ThreadPool;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Minimum number of rayon threads when detection fails
const MIN_RAYON_THREADS: usize = 1;

static GLOBAL_THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();

pub fn get_pool() -> &'static ThreadPool {
    GLOBAL_THREAD_POOL.get_or_init(|| {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_RAYON_THREADS)
            .max(MIN_RAYON_THREADS);

        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("pixbox-cpu-{i}"))
            .build()
            .or_else(|e| {
                error!(error = %e, num_threads, "thread pool build failed, using minimal pool");
                rayon::ThreadPoolBuilder::new()
                    .num_threads(MIN_RAYON_THREADS)
                    .build()
            })
            .unwrap_or_else(|e| panic!("cannot build any rayon thread pool: {e}"))
    })
}

/// Run `job` on the CPU pool and await its result.
pub async fn run_blocking<T, F>(job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    get_pool().spawn(move || run_job(tx, job));
    rx.await
        .map_err(|_| PixboxError::internal("CPU worker dropped the job without a result"))?
}

fn run_job<T, F>(tx: oneshot::Sender<Result<T>>, job: F)
where
    F: FnOnce() -> Result<T>,
{
    if tx.is_closed() {
        debug!("request went away before its transform started, skipping");
        return;
    }
    let result = match catch_unwind(AssertUnwindSafe(job)) {
        Ok(result) => result,
        Err(_) => {
            error!("transform job panicked");
            Err(PixboxError::internal("transform job panicked"))
        }
    };
    // Receiver gone means the request was cancelled mid-transform
    let _ = tx.send(result);
}
