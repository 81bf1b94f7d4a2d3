use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Lines written by a transport agent, as seen by the scheduler
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::incoming!(level = TRACE, $($msg)*)
    };
}

/// Commands the scheduler writes to a transport agent
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Output format of the log layer, picked with `LOG_FORMAT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Compact,
    Json,
}

impl Format {
    fn from_env(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

fn level_from_env(value: Option<&str>, default: LevelFilter) -> LevelFilter {
    value.map_or(default, |level| {
        LevelFilter::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, which happens
/// when several tests in one binary initialise logging.
pub fn init() -> bool {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let level = level_from_env(std::env::var("LOG_LEVEL").ok().as_deref(), default);
    let format = Format::from_env(std::env::var("LOG_FORMAT").ok().as_deref());
    let targets = FilterFn::new(|metadata| metadata.target().starts_with("empath"));

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339());

    let layer = match format {
        Format::Compact => layer.compact().with_ansi(true).boxed(),
        Format::Json => layer.json().with_ansi(false).boxed(),
    };

    tracing_subscriber::Registry::default()
        .with(layer.with_filter(level).with_filter(targets))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn level_defaults_when_unset() {
        assert_eq!(level_from_env(None, LevelFilter::INFO), LevelFilter::INFO);
    }

    #[test]
    fn level_parses_names() {
        assert_eq!(
            level_from_env(Some("debug"), LevelFilter::INFO),
            LevelFilter::DEBUG
        );
        assert_eq!(
            level_from_env(Some("WARN"), LevelFilter::INFO),
            LevelFilter::WARN
        );
    }

    #[test]
    fn level_falls_back_on_garbage() {
        assert_eq!(
            level_from_env(Some("loud"), LevelFilter::ERROR),
            LevelFilter::ERROR
        );
    }

    #[test]
    fn format_selection() {
        assert_eq!(Format::from_env(Some("JSON")), Format::Json);
        assert_eq!(Format::from_env(Some("compact")), Format::Compact);
        assert_eq!(Format::from_env(None), Format::Compact);
    }
}
