//! Tracing/logging initialization.
//!
//! JSON lines on stdout, filtered via `RUST_LOG` with an `info` default.
//! Worker and queue events carry structured fields (`job_id`,
//! `resource_id`, `worker`) so sync runs can be traced end to end.

use tracing_subscriber::EnvFilter;

/// Initialize tracing for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops), so tests and
/// embedding applications can both call it unconditionally.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init();
        super::init();
    }
}
