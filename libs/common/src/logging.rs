//! Console logging for the modstack tools
//!
//! Events are written as `timestamp [LEVEL] message`; `RUST_LOG` replaces the
//! configured level when set.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Crates whose events follow the configured level; everything else logs warnings only
const OWN_TARGETS: [&str; 3] = ["modstack", "modctl", "common"];

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("logging already initialised: {0}")]
    AlreadyInitialised(String),
}

/// Bracketed level tag: `[INFO]`, `[WARN]`, ...
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event format `2025-12-02T00:50:44.809000Z [INFO] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter directive applied when `RUST_LOG` is unset
pub fn default_directive(level: &str) -> String {
    let mut directive = String::from("warn");
    for target in OWN_TARGETS {
        directive.push_str(&format!(",{}={}", target, level));
    }
    directive
}

fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(env) if !env.trim().is_empty() => env,
        _ => default_directive(level),
    };
    EnvFilter::try_new(&filter).map_err(|e| LoggingError::InvalidFilter {
        filter,
        message: e.to_string(),
    })
}

/// Install the global subscriber: stderr, bracketed format, ANSI colours
///
/// `level` is a plain level name (`info`, `debug`, ...). Fails if a global
/// subscriber is already installed.
pub fn init_logging(level: &str) -> Result<(), LoggingError> {
    let filter = build_filter(level)?;
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .event_format(BracketedLevelFormat);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialised(e.to_string()))?;

    tracing::debug!("Logging initialised at {}", level);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_default_directive_scopes_own_crates() {
        assert_eq!(
            default_directive("debug"),
            "warn,modstack=debug,modctl=debug,common=debug"
        );
        assert!(EnvFilter::try_new(default_directive("trace")).is_ok());
    }

    #[test]
    fn test_bracketed_format() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .event_format(BracketedLevelFormat),
        );

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("listener stopped");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains(" [WARN] listener stopped"), "{}", output);
        assert!(output.ends_with('\n'));
    }
}
