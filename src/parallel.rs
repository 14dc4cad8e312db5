//! Global rayon thread-pool initialization.

use crate::{Error, Result};
use std::env;
use std::sync::OnceLock;

static THREAD_POOL_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Initialize a single global rayon thread pool for the matching kernels.
///
/// Call once at application startup. Repeated calls are idempotent and
/// return the first initialization result.
///
/// Priority order:
/// 1. explicit `num_threads`
/// 2. `ADCENSUS_CPU_THREADS` env var
/// 3. rayon default
pub fn init_thread_pool(num_threads: Option<usize>) -> Result<()> {
    THREAD_POOL_INIT
        .get_or_init(|| {
            let configured_threads = match num_threads {
                Some(n) => Some(n),
                None => read_cpu_threads_from_env().map_err(|e| e.to_string())?,
            };
            let Some(n) = configured_threads else {
                return Ok(());
            };

            rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build_global()
                .map_err(|e| {
                    format!(
                        "Failed to initialize global thread pool with \
                         {n} threads: {e}"
                    )
                })
        })
        .as_ref()
        .map_err(|e| Error::RuntimeError(e.clone()))?;
    Ok(())
}

fn read_cpu_threads_from_env() -> Result<Option<usize>> {
    let raw = match env::var("ADCENSUS_CPU_THREADS") {
        Ok(v) => v,
        Err(env::VarError::NotPresent) => return Ok(None),
        Err(e) => {
            return Err(Error::InvalidInput(format!(
                "Failed to read ADCENSUS_CPU_THREADS: {e}"
            )))
        }
    };

    let parsed: usize = raw.parse().map_err(|_| {
        Error::InvalidInput(format!(
            "ADCENSUS_CPU_THREADS must be a positive integer, got '{raw}'"
        ))
    })?;
    if parsed == 0 {
        return Err(Error::InvalidInput(
            "ADCENSUS_CPU_THREADS must be >= 1".to_string(),
        ));
    }
    Ok(Some(parsed))
}
