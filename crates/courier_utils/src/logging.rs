use tracing::Level;

/// Environment variable that overrides the level passed to [`init`].
pub const LOG_LEVEL_ENV: &str = "COURIER_LOG";

/// Map a textual level to a `tracing` level. Unknown names fall back to INFO.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the global fmt subscriber.
///
/// `COURIER_LOG` wins over `default_level` when set. Uses `try_init` so tests
/// and embedding applications can call this more than once.
pub fn init(default_level: &str) {
    let level = std::env::var(LOG_LEVEL_ENV)
        .map(|value| parse_level(&value))
        .unwrap_or_else(|_| parse_level(default_level));

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}
