//! Logging setup powered by `tracing-subscriber`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::error::{FeedError, FeedResult};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact text: timestamp LEVEL target - message.
    #[default]
    Compact,
    /// JSON lines for structured ingestion.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "jsonl" => Ok(Self::Json),
            "compact" | "text" | "plain" => Ok(Self::Compact),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Build the filter from a base level plus overrides for chatty dependencies.
///
/// `RUST_LOG`, when set, takes precedence.
pub fn build_env_filter(level: &str) -> FeedResult<EnvFilter> {
    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return Ok(from_env);
    }

    let mut directives = vec![level.to_string()];
    let noisy: &[(&str, &str)] = &[
        ("h2", "warn"),
        ("hyper", "warn"),
        ("tower", "warn"),
        ("sqlx", "warn"),
        ("redis", "warn"),
    ];
    for (target, lvl) in noisy {
        directives.push(format!("{target}={lvl}"));
    }

    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| FeedError::config(format!("invalid log filter '{filter_str}': {e}")))
}

/// Install the global subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init(level: &str, format: LogFormat) -> FeedResult<()> {
    let filter = build_env_filter(level)?;

    let layer = match format {
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| FeedError::internal(format!("failed to install log subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn builds_filter_for_plain_level() {
        assert!(build_env_filter("debug").is_ok());
    }
}
