//! Logging integration for persist-rs.
//!
//! Provides helpers for configuring [`tracing`]-based logging from
//! [`Settings`](crate::settings::Settings) and for creating per-statement spans.

use crate::settings::Settings;

/// Sets up the global tracing subscriber based on the given settings.
///
/// The log level is read from `settings.log_level` (e.g. "debug", "info",
/// "persist_rs_db=debug"). In debug mode a pretty, human-readable format is
/// used; otherwise a structured JSON format is used.
///
/// Installing a subscriber twice is not an error; the second call is ignored.
pub fn setup_logging(settings: &Settings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Creates a tracing span for a single SQL statement.
///
/// Log entries emitted while the statement runs carry its text.
///
/// # Examples
///
/// ```
/// use persist_rs_core::logging::statement_span;
///
/// let span = statement_span("SELECT 1");
/// let _guard = span.enter();
/// tracing::debug!("executing");
/// ```
pub fn statement_span(sql: &str) -> tracing::Span {
    tracing::debug_span!("statement", sql = sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_twice_is_harmless() {
        let settings = Settings {
            debug: true,
            log_level: "not a valid = filter[".to_string(),
            ..Settings::default()
        };
        setup_logging(&settings);
        setup_logging(&Settings::default());
    }

    #[test]
    fn test_statement_span_enters() {
        let span = statement_span("SELECT 1");
        let _guard = span.enter();
        tracing::debug!("inside statement span");
    }
}
