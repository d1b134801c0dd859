use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Filter defaults to `info` and is
/// overridden via `GATEHOUSE_LOG` (standard `EnvFilter` syntax).
pub fn init() {
    let filter =
        EnvFilter::try_from_env("GATEHOUSE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
