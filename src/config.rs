//! Feed configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};
use crate::record::SourceKind;

/// Default cursor namespace.
pub const DEFAULT_NAMESPACE: &str = "UGC_service";

/// Upper bound on a single fetch.
pub const MAX_BATCH_SIZE: usize = 100_000;

/// Configuration shared by every streaming session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Prefix of every cursor and counter key.
    pub namespace: String,
    /// Sources each session watches.
    pub sources: Vec<SourceKind>,
    /// Max records per fetch.
    pub batch_size: usize,
    /// Sleep between polls once a source is drained.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Capacity of the per-session fan-in queue.
    pub queue_capacity: usize,
    /// How long a cancelled session waits for its pollers.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
    /// Buffer between a session and the transport stream.
    pub stream_buffer: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            sources: SourceKind::ALL.to_vec(),
            batch_size: 1000,
            poll_interval: Duration::from_secs(5),
            queue_capacity: 1024,
            shutdown_grace: Duration::from_secs(5),
            stream_buffer: 128,
        }
    }
}

impl FeedConfig {
    /// Reject configurations a session cannot run with.
    pub fn validate(&self) -> FeedResult<()> {
        if self.namespace.trim().is_empty() {
            return Err(FeedError::config("namespace must not be empty"));
        }
        if self.namespace.contains(char::is_whitespace) {
            return Err(FeedError::config("namespace must not contain whitespace"));
        }
        if self.sources.is_empty() {
            return Err(FeedError::config("at least one source must be watched"));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(FeedError::config(format!(
                "batch_size must be in 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(FeedError::config("poll_interval must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(FeedError::config("queue_capacity must be positive"));
        }
        if self.stream_buffer == 0 {
            return Err(FeedError::config("stream_buffer must be positive"));
        }
        Ok(())
    }

    /// Sources without duplicates, in configured order.
    #[must_use]
    pub fn unique_sources(&self) -> Vec<SourceKind> {
        let mut out: Vec<SourceKind> = Vec::with_capacity(self.sources.len());
        for kind in &self.sources {
            if !out.contains(kind) {
                out.push(*kind);
            }
        }
        out
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = FeedConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.namespace, "UGC_service");
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn rejects_zero_batch() {
        let cfg = FeedConfig {
            batch_size: 0,
            ..FeedConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(FeedError::Config { .. })));
    }

    #[test]
    fn rejects_empty_sources() {
        let cfg = FeedConfig {
            sources: Vec::new(),
            ..FeedConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_partial_json_with_millis() {
        let cfg: FeedConfig =
            serde_json::from_str(r#"{"namespace":"feed","poll_interval":250,"sources":["rating","rating"]}"#).unwrap();
        assert_eq!(cfg.namespace, "feed");
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.unique_sources(), vec![SourceKind::Rating]);
    }
}
