//! Tracing setup for binaries embedding the resilience layer.

use tracing_subscriber::EnvFilter;

/// Initialize stderr logging. `RUST_LOG` wins when set; otherwise the
/// given default directive (e.g. `"vigil_core=info"`) applies.
///
/// Call once at startup; a second call is a no-op rather than a panic.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
