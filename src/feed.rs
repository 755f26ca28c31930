//! Feed facade: the registered sources plus the cursor store, shared by every
//! session and every one-shot query.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::activity::ActivityEvent;
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::record::SourceKind;
use crate::session::StreamSession;
use crate::storage::{CursorStore, DocumentSource, InMemoryStores};
use crate::transform::transform;

/// Document sources keyed by kind.
#[derive(Clone, Default)]
pub struct SourceSet {
    sources: BTreeMap<SourceKind, Arc<dyn DocumentSource>>,
}

impl SourceSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under its own kind, replacing any previous one.
    #[must_use]
    pub fn with(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.insert(source);
        self
    }

    /// Register `source` under its own kind, replacing any previous one.
    pub fn insert(&mut self, source: Arc<dyn DocumentSource>) {
        self.sources.insert(source.kind(), source);
    }

    /// All three in-memory collections.
    #[must_use]
    pub fn from_stores(stores: &InMemoryStores) -> Self {
        SourceKind::ALL
            .into_iter()
            .fold(Self::new(), |set, kind| set.with(stores.collection(kind)))
    }

    /// Source registered for `kind`.
    #[must_use]
    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn DocumentSource>> {
        self.sources.get(&kind).cloned()
    }

    /// Registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = SourceKind> + '_ {
        self.sources.keys().copied()
    }
}

impl fmt::Debug for SourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.sources.keys()).finish()
    }
}

/// Entry point used by the transport.
#[derive(Clone)]
pub struct ActivityFeed {
    config: FeedConfig,
    sources: SourceSet,
    cursors: Arc<dyn CursorStore>,
}

impl ActivityFeed {
    /// Build a feed; every configured source must be registered.
    ///
    /// # Errors
    /// - `Config`: invalid configuration
    /// - `SourceNotRegistered`: a configured source is missing from `sources`
    pub fn new(config: FeedConfig, sources: SourceSet, cursors: Arc<dyn CursorStore>) -> FeedResult<Self> {
        config.validate()?;
        if let Some(kind) = config.unique_sources().into_iter().find(|k| sources.get(*k).is_none()) {
            return Err(FeedError::SourceNotRegistered { kind });
        }
        Ok(Self {
            config,
            sources,
            cursors,
        })
    }

    /// Feed backed entirely by in-memory stores.
    ///
    /// # Errors
    /// Returns `Config` if `config` is invalid.
    pub fn from_memory(stores: &InMemoryStores, config: FeedConfig) -> FeedResult<Self> {
        let cursors: Arc<dyn CursorStore> = stores.cursors.clone();
        Self::new(config, SourceSet::from_stores(stores), cursors)
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Cursor store shared by every session.
    #[must_use]
    pub fn cursors(&self) -> Arc<dyn CursorStore> {
        Arc::clone(&self.cursors)
    }

    /// Open a new streaming session over every configured source.
    ///
    /// # Errors
    /// Fails if a cursor cannot be read; see [`StreamSession::start`].
    pub async fn open_session(&self) -> FeedResult<StreamSession> {
        StreamSession::start(&self.config, &self.sources, Arc::clone(&self.cursors)).await
    }

    /// Every current activity of `user_id`: bookmarks, then reviews, then
    /// ratings, each ascending by sequence. Malformed records are skipped.
    ///
    /// # Errors
    /// Returns `Fetch` if a source cannot be read.
    pub async fn user_activities(&self, user_id: &str) -> FeedResult<Vec<ActivityEvent>> {
        let mut out = Vec::new();
        for kind in [SourceKind::Bookmark, SourceKind::Review, SourceKind::Rating] {
            let Some(source) = self.sources.get(kind) else {
                continue;
            };
            let mut records = source
                .fetch_by_user(user_id)
                .await
                .map_err(|source| FeedError::Fetch { kind, source })?;
            records.sort_by_key(|r| r.monotonic_seq);

            for record in &records {
                match transform(kind, record) {
                    Ok(event) => out.push(event),
                    Err(err) => warn!(
                        source = %kind,
                        seq = %record.monotonic_seq,
                        user_id,
                        error = %err,
                        "skipping malformed record"
                    ),
                }
            }
        }
        debug!(user_id, count = out.len(), "collected user activities");
        Ok(out)
    }
}

impl fmt::Debug for ActivityFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityFeed")
            .field("config", &self.config)
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityPayload, ActivityType};
    use crate::record::{MonotonicSeq, SourceRecord};
    use crate::storage::WritableSource;

    fn seq(v: u64) -> MonotonicSeq {
        MonotonicSeq::new(v)
    }

    #[tokio::test]
    async fn user_activities_groups_by_kind_in_order() {
        let stores = InMemoryStores::new();
        stores
            .ratings
            .insert(SourceRecord::rating("u1", "f1", 9).with_seq(seq(1)))
            .await
            .unwrap();
        stores
            .bookmarks
            .insert(SourceRecord::bookmark("u1", "f3").with_seq(seq(2)))
            .await
            .unwrap();
        stores
            .bookmarks
            .insert(SourceRecord::bookmark("u1", "f2").with_seq(seq(1)))
            .await
            .unwrap();
        stores
            .reviews
            .insert(SourceRecord::review("u1", "f1", "fine", 6).with_seq(seq(1)))
            .await
            .unwrap();
        stores
            .bookmarks
            .insert(SourceRecord::bookmark("u2", "f9").with_seq(seq(3)))
            .await
            .unwrap();

        let feed = ActivityFeed::from_memory(&stores, FeedConfig::default()).unwrap();
        let events = feed.user_activities("u1").await.unwrap();

        let types: Vec<ActivityType> = events.iter().map(|e| e.activity_type).collect();
        assert_eq!(
            types,
            vec![
                ActivityType::Bookmark,
                ActivityType::Bookmark,
                ActivityType::Review,
                ActivityType::Rating
            ]
        );
        assert_eq!(events[0].payload, ActivityPayload::Bookmark { film_id: "f2".to_string() });
        assert!(events.iter().all(|e| e.user_id == "u1"));
    }

    #[tokio::test]
    async fn user_activities_skips_out_of_range_rating() {
        let stores = InMemoryStores::new();
        stores
            .ratings
            .insert(SourceRecord::rating("u1", "f1", 11).with_seq(seq(1)))
            .await
            .unwrap();
        stores
            .ratings
            .insert(SourceRecord::rating("u1", "f2", 10).with_seq(seq(2)))
            .await
            .unwrap();

        let feed = ActivityFeed::from_memory(&stores, FeedConfig::default()).unwrap();
        let events = feed.user_activities("u1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload.film_id(), "f2");
    }

    #[test]
    fn new_rejects_missing_source() {
        let stores = InMemoryStores::new();
        let sources = SourceSet::new().with(stores.ratings.clone());
        let err = ActivityFeed::new(FeedConfig::default(), sources, stores.cursors.clone()).unwrap_err();
        assert!(matches!(err, FeedError::SourceNotRegistered { kind: SourceKind::Bookmark }));
    }

    #[test]
    fn partial_source_config_is_accepted() {
        let stores = InMemoryStores::new();
        let sources = SourceSet::new().with(stores.ratings.clone());
        let config = FeedConfig {
            sources: vec![SourceKind::Rating],
            ..FeedConfig::default()
        };
        let feed = ActivityFeed::new(config, sources, stores.cursors.clone()).unwrap();
        assert_eq!(feed.config().sources, vec![SourceKind::Rating]);
    }
}
