//! Source poller.
//!
//! One poller watches one collection. Each iteration it reads the cursor,
//! fetches the next batch of records past it, persists the new cursor and only
//! then emits the batch, in sequence order, into the session's fan-in queue.
//!
//! Failure policy:
//! - fetch / cursor read errors: logged, retried with the same cursor after
//!   `poll_interval`
//! - cursor persist errors: fatal, the poller returns the error
//! - malformed records: logged and skipped, the cursor still moves past them

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FeedError, FeedResult};
use crate::fanin::FanInSender;
use crate::record::{MonotonicSeq, SourceKind, SourceRecord};
use crate::storage::{CursorKey, CursorStore, DocumentSource};
use crate::transform::{transformer_for, TransformFn};

/// Per-source poller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Watched collection.
    pub kind: SourceKind,
    /// Where progress is persisted.
    pub cursor_key: CursorKey,
    /// Max records per fetch.
    pub batch_size: usize,
    /// Sleep between polls once the source is drained.
    pub poll_interval: Duration,
}

impl PollerConfig {
    /// Settings for `kind`, with its cursor under `namespace`.
    #[must_use]
    pub fn new(namespace: &str, kind: SourceKind, batch_size: usize, poll_interval: Duration) -> Self {
        Self {
            kind,
            cursor_key: CursorKey::last_seq(namespace, kind),
            batch_size: batch_size.max(1),
            poll_interval,
        }
    }
}

/// In-memory view of a poller's progress during one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollCursorState {
    /// Highest sequence persisted by this poller (or read from the store).
    pub last_seen_seq: MonotonicSeq,
}

/// Counters for one poller run.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub batches: u64,
    pub delivered: u64,
    pub skipped: u64,
    pub transient_errors: u64,
}

/// Result of a single fetch-persist-emit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing new past the cursor.
    Empty,
    /// A short batch was processed; the source is drained for now.
    Partial {
        /// Events enqueued.
        delivered: usize,
    },
    /// A full batch was processed; more records may be waiting.
    Full {
        /// Events enqueued.
        delivered: usize,
    },
    /// Cancellation was observed or the consumer went away.
    Stopped,
}

/// Polls one document source and emits activity events.
pub struct SourcePoller {
    config: PollerConfig,
    source: Arc<dyn DocumentSource>,
    cursors: Arc<dyn CursorStore>,
    transform: TransformFn,
    state: PollCursorState,
    stats: PollerStats,
}

impl SourcePoller {
    /// Poller over `source`, using the standard transformer for its kind.
    #[must_use]
    pub fn new(config: PollerConfig, source: Arc<dyn DocumentSource>, cursors: Arc<dyn CursorStore>) -> Self {
        let transform = transformer_for(config.kind);
        Self::with_transform(config, source, cursors, transform)
    }

    /// Poller with an explicit transformer.
    #[must_use]
    pub fn with_transform(
        config: PollerConfig,
        source: Arc<dyn DocumentSource>,
        cursors: Arc<dyn CursorStore>,
        transform: TransformFn,
    ) -> Self {
        Self {
            config,
            source,
            cursors,
            transform,
            state: PollCursorState::default(),
            stats: PollerStats::default(),
        }
    }

    /// Watched collection.
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        self.config.kind
    }

    /// Settings.
    #[must_use]
    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Current in-memory cursor.
    #[must_use]
    pub fn state(&self) -> PollCursorState {
        self.state
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> PollerStats {
        self.stats
    }

    /// Read the persisted cursor (zero when absent).
    pub async fn load_cursor(&mut self) -> FeedResult<MonotonicSeq> {
        let key = &self.config.cursor_key;
        let seq = self
            .cursors
            .get(key)
            .await
            .map_err(|source| FeedError::CursorRead {
                key: key.to_string(),
                source,
            })?
            .unwrap_or(MonotonicSeq::ZERO);
        self.state.last_seen_seq = seq;
        Ok(seq)
    }

    /// Run until cancelled, the consumer goes away, or a fatal error occurs.
    pub async fn run(mut self, sink: FanInSender, cancel: CancellationToken) -> FeedResult<PollerStats> {
        let kind = self.config.kind;
        info!(source = %kind, key = %self.config.cursor_key, "poller started");

        'outer: loop {
            if cancel.is_cancelled() {
                break;
            }

            // Catch up without sleeping while batches come back full.
            loop {
                match self.poll_batch(&sink, &cancel).await {
                    Ok(BatchOutcome::Full { delivered }) => {
                        debug!(source = %kind, delivered, "full batch, polling again");
                    }
                    Ok(BatchOutcome::Empty | BatchOutcome::Partial { .. }) => break,
                    Ok(BatchOutcome::Stopped) => break 'outer,
                    Err(err) if err.is_fatal() => {
                        error!(source = %kind, error = %err, "poller aborted");
                        return Err(err);
                    }
                    Err(err) => {
                        self.stats.transient_errors += 1;
                        warn!(
                            source = %kind,
                            cursor = %self.state.last_seen_seq,
                            error = %err,
                            "poll failed, retrying after interval"
                        );
                        break;
                    }
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(
            source = %kind,
            cursor = %self.state.last_seen_seq,
            delivered = self.stats.delivered,
            skipped = self.stats.skipped,
            "poller stopped"
        );
        Ok(self.stats)
    }

    /// One fetch-persist-emit step.
    pub async fn poll_batch(&mut self, sink: &FanInSender, cancel: &CancellationToken) -> FeedResult<BatchOutcome> {
        let kind = self.config.kind;
        let last = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(BatchOutcome::Stopped),
            last = self.load_cursor() => last?,
        };

        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(BatchOutcome::Stopped),
            fetched = self.source.fetch_after(last, self.config.batch_size) => fetched,
        };
        let mut batch = fetched.map_err(|source| FeedError::Fetch { kind, source })?;
        if batch.is_empty() {
            return Ok(BatchOutcome::Empty);
        }

        let full = batch.len() >= self.config.batch_size;
        batch.sort_by_key(|record| record.monotonic_seq);
        let before = batch.len();
        batch.retain(|record| record.monotonic_seq > last);
        if batch.len() != before {
            warn!(source = %kind, cursor = %last, dropped = before - batch.len(), "source returned records at or below cursor");
        }
        let Some(max_seq) = batch.last().map(|record| record.monotonic_seq) else {
            return Ok(BatchOutcome::Empty);
        };

        self.persist(max_seq).await?;
        self.stats.batches += 1;

        let delivered_before = self.stats.delivered;
        for record in &batch {
            if !self.emit(record, sink, cancel).await? {
                return Ok(BatchOutcome::Stopped);
            }
        }
        let delivered = usize::try_from(self.stats.delivered - delivered_before).unwrap_or(usize::MAX);

        debug!(source = %kind, cursor = %max_seq, records = batch.len(), "batch processed");
        if full {
            Ok(BatchOutcome::Full { delivered })
        } else {
            Ok(BatchOutcome::Partial { delivered })
        }
    }

    async fn persist(&mut self, seq: MonotonicSeq) -> FeedResult<()> {
        let key = &self.config.cursor_key;
        self.cursors
            .set(key, seq)
            .await
            .map_err(|source| FeedError::CursorPersist {
                key: key.to_string(),
                source,
            })?;
        self.state.last_seen_seq = seq;
        Ok(())
    }

    /// Transform and enqueue one record. `Ok(false)` means stop.
    ///
    /// Malformed records count as handled.
    async fn emit(&mut self, record: &SourceRecord, sink: &FanInSender, cancel: &CancellationToken) -> FeedResult<bool> {
        let event = match (self.transform)(record) {
            Ok(event) => event,
            Err(err) => {
                self.stats.skipped += 1;
                warn!(source = %self.config.kind, seq = %record.monotonic_seq, id = %record.id, error = %err, "skipping malformed record");
                return Ok(true);
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(false),
            sent = sink.put(event) => {
                if sent.is_err() {
                    return Ok(false);
                }
                self.stats.delivered += 1;
                Ok(true)
            }
        }
    }
}

impl std::fmt::Debug for SourcePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePoller")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityType;
    use crate::fanin;
    use crate::storage::{InMemoryStores, StorageError, WritableSource};

    /// Cursor store that never answers.
    struct StalledCursorStore;

    #[async_trait::async_trait]
    impl CursorStore for StalledCursorStore {
        async fn get(&self, _key: &CursorKey) -> Result<Option<MonotonicSeq>, StorageError> {
            std::future::pending().await
        }

        async fn set(&self, _key: &CursorKey, _value: MonotonicSeq) -> Result<(), StorageError> {
            std::future::pending().await
        }

        async fn increment(&self, _key: &CursorKey) -> Result<MonotonicSeq, StorageError> {
            std::future::pending().await
        }
    }

    async fn seed(stores: &InMemoryStores, seqs: &[u64]) {
        for &s in seqs {
            stores
                .bookmarks
                .insert(SourceRecord::bookmark("u", &format!("f{s}")).with_seq(MonotonicSeq::new(s)))
                .await
                .unwrap();
        }
    }

    fn poller(stores: &InMemoryStores, batch_size: usize) -> SourcePoller {
        SourcePoller::new(
            PollerConfig::new("ns", SourceKind::Bookmark, batch_size, Duration::from_millis(10)),
            stores.bookmarks.clone(),
            stores.cursors.clone(),
        )
    }

    #[tokio::test]
    async fn empty_source_reports_empty() {
        let stores = InMemoryStores::new();
        let mut p = poller(&stores, 10);
        let (tx, _rx) = fanin::bounded(4);
        let out = p.poll_batch(&tx, &CancellationToken::new()).await.unwrap();
        assert_eq!(out, BatchOutcome::Empty);
        assert_eq!(p.state().last_seen_seq, MonotonicSeq::ZERO);
    }

    #[tokio::test]
    async fn full_then_partial_batches_advance_cursor() {
        let stores = InMemoryStores::new();
        seed(&stores, &[1, 2, 3]).await;
        let mut p = poller(&stores, 2);
        let (tx, mut rx) = fanin::bounded(8);
        let cancel = CancellationToken::new();

        assert_eq!(p.poll_batch(&tx, &cancel).await.unwrap(), BatchOutcome::Full { delivered: 2 });
        assert_eq!(
            stores.cursors.value(&CursorKey::last_seq("ns", SourceKind::Bookmark)).unwrap(),
            Some(MonotonicSeq::new(2))
        );
        assert_eq!(p.poll_batch(&tx, &cancel).await.unwrap(), BatchOutcome::Partial { delivered: 1 });
        assert_eq!(p.state().last_seen_seq, MonotonicSeq::new(3));
        assert_eq!(p.poll_batch(&tx, &cancel).await.unwrap(), BatchOutcome::Empty);

        let seqs: Vec<u64> = std::iter::from_fn(|| rx.try_get()).map(|e| e.seq.get()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn resumes_from_persisted_cursor() {
        let stores = InMemoryStores::new();
        seed(&stores, &[1, 2, 3, 4]).await;
        stores
            .cursors
            .set(&CursorKey::last_seq("ns", SourceKind::Bookmark), MonotonicSeq::new(2))
            .await
            .unwrap();

        let mut p = poller(&stores, 10);
        let (tx, mut rx) = fanin::bounded(8);
        p.poll_batch(&tx, &CancellationToken::new()).await.unwrap();

        let seqs: Vec<u64> = std::iter::from_fn(|| rx.try_get()).map(|e| e.seq.get()).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn malformed_record_is_skipped_but_passed() {
        let stores = InMemoryStores::new();
        seed(&stores, &[1]).await;
        let mut bad = SourceRecord::bookmark("u", "f").with_seq(MonotonicSeq::new(2));
        bad.fields.remove("film_id");
        stores.bookmarks.insert(bad).await.unwrap();
        seed(&stores, &[3]).await;

        let mut p = poller(&stores, 10);
        let (tx, mut rx) = fanin::bounded(8);
        let out = p.poll_batch(&tx, &CancellationToken::new()).await.unwrap();
        assert_eq!(out, BatchOutcome::Partial { delivered: 2 });
        assert_eq!(p.stats().skipped, 1);
        assert_eq!(p.stats().delivered, 2);
        assert_eq!(p.state().last_seen_seq, MonotonicSeq::new(3));

        let events: Vec<_> = std::iter::from_fn(|| rx.try_get()).collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.activity_type == ActivityType::Bookmark));
        assert_eq!(events[0].seq.get(), 1);
        assert_eq!(events[1].seq.get(), 3);
    }

    #[tokio::test]
    async fn cancelled_poll_stops_before_fetch() {
        let stores = InMemoryStores::new();
        seed(&stores, &[1]).await;
        let mut p = poller(&stores, 10);
        let (tx, _rx) = fanin::bounded(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(p.poll_batch(&tx, &cancel).await.unwrap(), BatchOutcome::Stopped);
        assert_eq!(
            stores.cursors.value(&CursorKey::last_seq("ns", SourceKind::Bookmark)).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn closed_queue_stops_run() {
        let stores = InMemoryStores::new();
        seed(&stores, &[1, 2]).await;
        let p = poller(&stores, 10);
        let (tx, rx) = fanin::bounded(1);
        drop(rx);
        let stats = p.run(tx, CancellationToken::new()).await.unwrap();
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_cursor_read_observes_cancellation() {
        let stores = InMemoryStores::new();
        let source: Arc<dyn DocumentSource> = stores.bookmarks.clone();
        let config = PollerConfig::new("ns", SourceKind::Bookmark, 10, Duration::from_millis(10));
        let mut p = SourcePoller::new(config, source, Arc::new(StalledCursorStore));
        let (tx, _rx) = fanin::bounded(4);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let out = tokio::time::timeout(Duration::from_secs(1), p.poll_batch(&tx, &cancel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, BatchOutcome::Stopped);
    }
}
