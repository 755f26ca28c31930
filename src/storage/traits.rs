//! Abstract storage traits for the activity feed.
//!
//! These traits define the contract the core needs from its two external
//! collaborators:
//! - a key/value store holding cursors and sequence counters
//! - one document source per watched collection

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{MonotonicSeq, SourceKind, SourceRecord};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stored value could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend is not reachable or not initialized.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Returns true if the same call may succeed later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Connection(_) | Self::Unavailable(_))
    }
}

/// Key in the cursor store.
///
/// Keys are namespaced per `(subsystem, source)`:
/// `<namespace>:<source>:last_seq` for cursors and
/// `<namespace>:<source>:counter` for the write-path sequence counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CursorKey(String);

impl CursorKey {
    /// Cursor key for `kind` under `namespace`.
    #[must_use]
    pub fn last_seq(namespace: &str, kind: SourceKind) -> Self {
        Self(format!("{namespace}:{kind}:last_seq"))
    }

    /// Sequence counter key for `kind` under `namespace`.
    #[must_use]
    pub fn counter(namespace: &str, kind: SourceKind) -> Self {
        Self(format!("{namespace}:{kind}:counter"))
    }

    /// Raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CursorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key/value store for cursors and sequence counters.
///
/// Each key is updated independently; no cross-key transaction is assumed.
/// This store is the only durable record of poller progress.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Read a value. `Ok(None)` when the key has never been written.
    async fn get(&self, key: &CursorKey) -> Result<Option<MonotonicSeq>, StorageError>;

    /// Overwrite a value. No expiry.
    async fn set(&self, key: &CursorKey, value: MonotonicSeq) -> Result<(), StorageError>;

    /// Atomically increment a counter and return the new value.
    ///
    /// Used by the write path to hand out sequence numbers; a missing key
    /// counts as zero, so the first call returns 1.
    async fn increment(&self, key: &CursorKey) -> Result<MonotonicSeq, StorageError>;
}

/// Read access to one watched collection.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Which collection this is.
    fn kind(&self) -> SourceKind;

    /// Up to `limit` records with `monotonic_seq > after`, ascending by sequence.
    async fn fetch_after(&self, after: MonotonicSeq, limit: usize) -> Result<Vec<SourceRecord>, StorageError>;

    /// Every record owned by `user_id`, ascending by sequence.
    async fn fetch_by_user(&self, user_id: &str) -> Result<Vec<SourceRecord>, StorageError>;
}

/// Write access to one watched collection.
///
/// Callers must stamp `monotonic_seq` before calling `insert`; see
/// [`crate::writer::SequencedWriter`].
#[async_trait]
pub trait WritableSource: DocumentSource {
    /// Insert a sequenced record, making it visible to readers.
    ///
    /// # Errors
    /// - `DuplicateKey`: a record with the same id or sequence already exists
    async fn insert(&self, record: SourceRecord) -> Result<(), StorageError>;
}
