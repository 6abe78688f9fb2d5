//! Structured Logging Configuration
//!
//! - JSON output for production (LOG_FORMAT=json)
//! - Human-readable output for development (default)
//!
//! # Usage
//!
//! ```rust,ignore
//! use ferry_common::logging::init_logging;
//!
//! fn main() {
//!     init_logging("ferry", false);
//!     tracing::info!(queue = %name, "Consumer started");
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: Set to "json" for JSON output, anything else for text (default: text)
//! - `RUST_LOG`: Standard log level filter (default: info, or debug when verbose)
//!   Examples: `RUST_LOG=debug`, `RUST_LOG=ferry_worker=trace,aws_config=warn`

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Adjusts the level of an installed subscriber once the configuration is known
pub struct LoggingHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    explicit: bool,
}

impl LoggingHandle {
    /// Switch the default level between info and debug. No-op when `RUST_LOG` is set.
    pub fn set_verbose(&self, verbose: bool) -> Result<(), reload::Error> {
        if self.explicit {
            return Ok(());
        }
        self.filter.reload(filter_from(None, verbose))
    }
}

/// Initialize logging with the given service name.
///
/// Call before loading configuration so loader warnings are emitted. `verbose`
/// only changes the default level; an explicit `RUST_LOG` always wins.
pub fn init_logging(service_name: &str, verbose: bool) -> LoggingHandle {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let (filter, handle) = reload::Layer::new(filter_from(directives.as_deref(), verbose));

    if log_format.eq_ignore_ascii_case("json") {
        init_json_logging(filter);
    } else {
        init_text_logging(filter);
    }

    tracing::debug!(service = %service_name, "Logging initialized");
    LoggingHandle {
        filter: handle,
        explicit: directives.is_some(),
    }
}

/// Build the filter from `RUST_LOG`-style directives, falling back to the
/// verbosity default when they are absent or invalid
pub fn filter_from(directives: Option<&str>, verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { "info" };
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level))
}

fn init_json_logging(filter: reload::Layer<EnvFilter, Registry>) {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(false)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE)
        )
        .init();
}

fn init_text_logging(filter: reload::Layer<EnvFilter, Registry>) {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true)
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_verbose_sets_default_level() {
        assert_eq!(filter_from(None, false).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(filter_from(None, true).max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_directives_win_over_verbose() {
        assert_eq!(filter_from(Some("warn"), true).max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(
            filter_from(Some("ferry_worker=trace"), false).max_level_hint(),
            Some(LevelFilter::TRACE)
        );
    }

    #[test]
    fn test_invalid_directives_fall_back() {
        assert_eq!(
            filter_from(Some("ferry=notalevel"), true).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
    }

    #[test]
    fn test_set_verbose_reloads_filter() {
        let (layer, handle) = reload::Layer::new(filter_from(None, false));
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));
        let logging = LoggingHandle { filter: handle, explicit: false };

        assert!(!tracing::enabled!(tracing::Level::DEBUG));
        logging.set_verbose(true).unwrap();
        assert!(tracing::enabled!(tracing::Level::DEBUG));
    }

    #[test]
    fn test_set_verbose_keeps_explicit_filter() {
        let (layer, handle) = reload::Layer::new(filter_from(Some("info"), false));
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));
        let logging = LoggingHandle { filter: handle, explicit: true };

        logging.set_verbose(true).unwrap();
        assert!(!tracing::enabled!(tracing::Level::DEBUG));
    }
}
