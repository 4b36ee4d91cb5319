//! Tracing initialization.
//!
//! Controlled by two environment variables:
//! - `RUST_LOG`: the usual `EnvFilter` directives (default `info`).
//! - `ENGINE_LOG_FORMAT`: `text` (default) or `json`. Both go to stderr so
//!   that process and nailgun output on stdout stays clean.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub const FORMAT_ENV_VAR: &str = "ENGINE_LOG_FORMAT";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "unknown log format {other:?}; expected \"text\" or \"json\""
            )),
        }
    }
}

/// Install the global subscriber. Safe to call more than once: later calls
/// (e.g. a second Python import) are no-ops.
pub fn init() {
    let format = match std::env::var(FORMAT_ENV_VAR) {
        Ok(value) => value.parse().unwrap_or_else(|e: String| {
            eprintln!("warning: {FORMAT_ENV_VAR}: {e}");
            LogFormat::Text
        }),
        Err(_) => LogFormat::Text,
    };
    init_with(format);
}

fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE),
            )
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" JSON ".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("yaml".parse::<LogFormat>().unwrap_err().contains("yaml"));
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_with(LogFormat::Text);
        init_with(LogFormat::Json);
    }
}
