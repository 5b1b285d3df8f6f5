//! Console logging for the initramfs.

use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber; `RUST_LOG` overrides the `info` default.
///
/// A second call, or a subscriber installed by the caller, is reported and
/// otherwise ignored.
pub fn init() {
    if let Err(e) = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
    {
        eprintln!("[ERROR] Failed to initialize tracing: {}", e);
    }
}
