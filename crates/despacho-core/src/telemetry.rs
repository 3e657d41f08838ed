use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// - Debug builds: human-readable output
/// - Release builds: JSON output for log aggregation
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. Calling this
/// when a subscriber is already installed is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init();
    }
}
