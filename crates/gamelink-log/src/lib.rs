//! Structured logging for the gamelink networking stack.
//!
//! Console output with uptime timestamps and module paths, plus JSON file
//! logging when enabled in the debug config. Connection managers run on the
//! dispatcher thread and I/O completions on runtime worker threads, so thread
//! names are always included.

use gamelink_config::Config;
use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config sets a level.
pub const DEFAULT_FILTER: &str = "info,tokio=warn,mio=warn";

/// Name of the JSON log file written under `log_dir`.
pub const LOG_FILE_NAME: &str = "gamelink.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file; only used when
///   `config.debug.file_logging` is set
/// * `config` - optional configuration supplying the level override
///
/// `RUST_LOG` always wins over the configured level.
///
/// ```no_run
/// use gamelink_config::Config;
/// use gamelink_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, config: Option<&Config>) {
    let filter_str = filter_for(config);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let file_logging = config.is_some_and(|c| c.debug.file_logging);
    if file_logging
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// Filter string derived from the config, falling back to [`DEFAULT_FILTER`].
pub fn filter_for(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.is_empty() => {
            format!("{},tokio=warn,mio=warn", config.debug.log_level)
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let filter_str = format!("{}", default_env_filter());
        assert!(filter_str.contains("tokio=warn"));
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_filter_uses_configured_level() {
        let mut config = Config::default();
        config.debug.log_level = "debug".to_string();
        let filter = filter_for(Some(&config));
        assert!(filter.starts_with("debug"));
        assert!(filter.contains("mio=warn"));
    }

    #[test]
    fn test_empty_level_falls_back_to_default() {
        let mut config = Config::default();
        config.debug.log_level.clear();
        assert_eq!(filter_for(Some(&config)), DEFAULT_FILTER);
        assert_eq!(filter_for(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_subsystem_filters_parse() {
        let valid_filters = [
            "info",
            "debug,gamelink_net=trace",
            "warn,gamelink_net::conn=debug",
            "error",
        ];

        for filter_str in &valid_filters {
            let result = EnvFilter::try_from(*filter_str);
            assert!(result.is_ok(), "Failed to parse filter: {}", filter_str);
        }
    }

    #[test]
    fn test_log_file_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_file_path = temp_dir.path().join(LOG_FILE_NAME);
        assert_eq!(log_file_path.file_name().unwrap(), "gamelink.log");
    }
}
