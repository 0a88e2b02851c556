//! Process-wide logging setup.

/// Initialize tracing/logging for the process.
///
/// JSON lines with system-time timestamps, filtered by `RUST_LOG` (default
/// `info`). Safe to call multiple times; later calls are no-ops.
pub fn init() {
    logging::init("info");
}

pub mod logging;
