//! Error types for the activity feed.
//!
//! All errors are strongly typed using thiserror so callers can tell a
//! transient fetch hiccup apart from a fatal cursor failure.

use thiserror::Error;

use crate::record::{MonotonicSeq, SourceKind};
use crate::storage::StorageError;

/// A source record that cannot be turned into an activity.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{kind} record {seq}: required field '{field}' is missing")]
    MissingField {
        kind: SourceKind,
        seq: MonotonicSeq,
        field: &'static str,
    },

    #[error("{kind} record {seq}: field '{field}' is invalid: {reason}")]
    InvalidField {
        kind: SourceKind,
        seq: MonotonicSeq,
        field: &'static str,
        reason: String,
    },
}

impl RecordError {
    /// Sequence number of the offending record.
    #[must_use]
    pub const fn seq(&self) -> MonotonicSeq {
        match self {
            Self::MissingField { seq, .. } | Self::InvalidField { seq, .. } => *seq,
        }
    }
}

/// Top-level error type for the activity feed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Malformed record: {0}")]
    Record(#[from] RecordError),

    #[error("Failed to fetch {kind} records: {source}")]
    Fetch {
        kind: SourceKind,
        #[source]
        source: StorageError,
    },

    #[error("Failed to read cursor '{key}': {source}")]
    CursorRead {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to persist cursor '{key}': {source}")]
    CursorPersist {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to allocate sequence number from '{key}': {source}")]
    SequenceAllocation {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to write {kind} record: {source}")]
    Write {
        kind: SourceKind,
        #[source]
        source: StorageError,
    },

    #[error("{kind} poller failed: {reason}")]
    PollerFailed {
        kind: SourceKind,
        reason: String,
    },

    #[error("No document source registered for {kind}")]
    SourceNotRegistered {
        kind: SourceKind,
    },

    #[error("Invalid configuration: {message}")]
    Config {
        message: String,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl FeedError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid-request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error must tear down the streaming session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CursorPersist { .. }
                | Self::PollerFailed { .. }
                | Self::SourceNotRegistered { .. }
                | Self::Internal { .. }
        )
    }

    /// Returns true if retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch { .. } | Self::CursorRead { .. } => true,
            Self::SequenceAllocation { source, .. } | Self::Write { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }
}

/// Result type alias for activity feed operations.
pub type FeedResult<T> = Result<T, FeedError>;
