//! Sequenced write path.
//!
//! A record only becomes visible to pollers after it has been stamped with a
//! sequence number from the shared counter. The increment happens here,
//! synchronously, before the insert; an insert that has not obtained a
//! sequence number is never attempted.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{FeedError, FeedResult};
use crate::record::{MonotonicSeq, SourceKind, SourceRecord};
use crate::storage::{CursorKey, CursorStore, WritableSource};

/// Writes records into their collections with freshly allocated sequence numbers.
pub struct SequencedWriter {
    namespace: String,
    counters: Arc<dyn CursorStore>,
    targets: HashMap<SourceKind, Arc<dyn WritableSource>>,
}

impl SequencedWriter {
    /// Writer allocating from counters under `namespace`.
    #[must_use]
    pub fn new(namespace: impl Into<String>, counters: Arc<dyn CursorStore>) -> Self {
        Self {
            namespace: namespace.into(),
            counters,
            targets: HashMap::new(),
        }
    }

    /// Register the collection backing `target.kind()`.
    #[must_use]
    pub fn with_target(mut self, target: Arc<dyn WritableSource>) -> Self {
        self.targets.insert(target.kind(), target);
        self
    }

    /// Allocate the next sequence number for `kind`.
    pub async fn next_seq(&self, kind: SourceKind) -> FeedResult<MonotonicSeq> {
        let key = CursorKey::counter(&self.namespace, kind);
        self.counters
            .increment(&key)
            .await
            .map_err(|source| FeedError::SequenceAllocation {
                key: key.to_string(),
                source,
            })
    }

    /// Stamp `record` with the next sequence number for `kind` and insert it.
    ///
    /// Returns the stored record.
    pub async fn write(&self, kind: SourceKind, record: SourceRecord) -> FeedResult<SourceRecord> {
        let target = self
            .targets
            .get(&kind)
            .ok_or(FeedError::SourceNotRegistered { kind })?;

        let seq = self.next_seq(kind).await?;
        let record = record.with_seq(seq);
        target
            .insert(record.clone())
            .await
            .map_err(|source| FeedError::Write { kind, source })?;

        debug!(source = %kind, seq = %seq, id = %record.id, "record written");
        Ok(record)
    }
}

impl std::fmt::Debug for SequencedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencedWriter")
            .field("namespace", &self.namespace)
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DocumentSource, InMemoryStores};

    fn writer(stores: &InMemoryStores) -> SequencedWriter {
        SequencedWriter::new("ns", stores.cursors.clone())
            .with_target(stores.bookmarks.clone())
            .with_target(stores.reviews.clone())
    }

    #[tokio::test]
    async fn sequences_are_per_source_and_increasing() {
        let stores = InMemoryStores::new();
        let w = writer(&stores);

        let a = w.write(SourceKind::Bookmark, SourceRecord::bookmark("u", "f1")).await.unwrap();
        let b = w.write(SourceKind::Bookmark, SourceRecord::bookmark("u", "f2")).await.unwrap();
        let c = w.write(SourceKind::Review, SourceRecord::review("u", "f1", "t", 3)).await.unwrap();

        assert_eq!(a.monotonic_seq, MonotonicSeq::new(1));
        assert_eq!(b.monotonic_seq, MonotonicSeq::new(2));
        assert_eq!(c.monotonic_seq, MonotonicSeq::new(1));

        let stored = stores.bookmarks.fetch_after(MonotonicSeq::ZERO, 10).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn unregistered_target_is_rejected_before_allocating() {
        let stores = InMemoryStores::new();
        let w = writer(&stores);

        let err = w
            .write(SourceKind::Rating, SourceRecord::rating("u", "f", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::SourceNotRegistered { kind: SourceKind::Rating }));
        assert_eq!(
            stores.cursors.value(&CursorKey::counter("ns", SourceKind::Rating)).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn concurrent_writers_get_distinct_sequences() {
        let stores = InMemoryStores::new();
        let w = Arc::new(writer(&stores));

        let mut handles = Vec::new();
        for i in 0..16 {
            let w = Arc::clone(&w);
            handles.push(tokio::spawn(async move {
                w.write(SourceKind::Bookmark, SourceRecord::bookmark("u", &format!("f{i}")))
                    .await
                    .unwrap()
                    .monotonic_seq
            }));
        }

        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap().get());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=16).collect::<Vec<u64>>());
    }
}
