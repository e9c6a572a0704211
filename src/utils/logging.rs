use crate::config::LoggingSettings;

/// Maps a configured level name onto a tracing level. Unknown names log at
/// `INFO`.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

/// Initialize tracing for the process.
///
/// Targets are the logging categories of this crate (`popmsg::session`,
/// `popmsg::flow`, ...); `show_targets` prints them next to each line.
/// Uses `try_init` so tests and embedding applications can call this more
/// than once.
pub fn init(settings: &LoggingSettings) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(&settings.level))
        .with_target(settings.show_targets)
        .try_init();
}
